//! Pure segmentation planner: turns an I-frame list and a duration into
//! segment boundaries honoring a target length and tolerance (spec.md
//! §4.1).

pub const DEFAULT_TARGET_LENGTH: f64 = 3.5;
pub const DEFAULT_TOLERANCE: f64 = 1.25;

/// Compute segment boundaries `b[0..=N]` with `b[0] = 0`, `b[N] = duration`,
/// strictly increasing, such that every interior gap lies in
/// `[target_length - tolerance, target_length + tolerance]`, with at most
/// one tolerated exception where the final leftover is shorter than the
/// minimum and gets absorbed as its own short trailing segment.
pub fn plan(iframes: &[f64], duration: f64, target_length: f64, tolerance: f64) -> Vec<f64> {
    let min_seg = target_length - tolerance;
    let max_seg = target_length + tolerance;

    let mut candidates: Vec<f64> = iframes.to_vec();
    candidates.push(duration);

    let mut last_time = 0.0f64;
    let mut out = vec![0.0f64];

    for &t in &candidates {
        let gap = t - last_time;
        if gap < min_seg {
            // Coalesce into whatever segment eventually claims this span.
            continue;
        } else if gap < max_seg {
            out.push(t);
            last_time = t;
        } else {
            let k = (gap / target_length).ceil() as u64;
            let width = gap / (k as f64);
            for i in 1..k {
                out.push(last_time + width * (i as f64));
            }
            out.push(t);
            last_time = t;
        }
    }

    if *out.last().unwrap() != duration {
        // The terminal duration itself was coalesced away; it must still
        // end the plan, as a short trailing segment.
        out.push(duration);
    } else if out.len() >= 2 {
        let preceding = out[out.len() - 2];
        if duration - preceding > max_seg {
            out.pop();
            let midpoint = (preceding + duration) / 2.0;
            out.push(midpoint);
            out.push(duration);
        }
        // Otherwise no-op: the plan already ends correctly.
    }

    out
}

/// Convenience wrapper using the system defaults (L=3.5s, O=1.25s).
pub fn plan_default(iframes: &[f64], duration: f64) -> Vec<f64> {
    plan(iframes, duration, DEFAULT_TARGET_LENGTH, DEFAULT_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn scenario_basic_plan() {
        let got = plan(&[3.0, 6.0, 20.0], 31.0, 3.5, 1.25);
        let want = [
            0.0, 3.0, 6.0, 9.5, 13.0, 16.5, 20.0, 22.75, 25.5, 28.25, 31.0,
        ];
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want.iter()) {
            assert!(approx_eq(*g, *w), "{g} != {w}");
        }
    }

    #[test]
    fn always_starts_at_zero_ends_at_duration_and_is_increasing() {
        for &(l, o) in &[(3.5, 1.25), (10.0, 5.0), (50.0, 1.0), (20.0, 19.0), (1.0, 0.5)] {
            for &d in &[1.0, 7.5, 31.0, 123.4, 600.0] {
                let b = plan(&[], d, l, o);
                assert_eq!(b[0], 0.0);
                assert!(approx_eq(*b.last().unwrap(), d));
                for w in b.windows(2) {
                    assert!(w[1] > w[0]);
                }
            }
        }
    }

    #[test]
    fn gaps_respect_tolerance_except_one_trailing_exception() {
        for &(l, o) in &[(3.5, 1.25), (10.0, 5.0), (50.0, 1.0), (20.0, 19.0), (1.0, 0.5)] {
            let min_seg = l - o;
            let max_seg = l + o;
            for &d in &[1.0, 7.5, 31.0, 123.4, 600.0] {
                let b = plan(&[2.0, 45.0, 90.0, 200.0], d, l, o);
                let gaps: Vec<f64> = b.windows(2).map(|w| w[1] - w[0]).collect();
                let exceptions = gaps
                    .iter()
                    .filter(|&&g| g < min_seg - 1e-9 || g > max_seg + 1e-9)
                    .count();
                assert!(exceptions <= 1, "too many out-of-tolerance gaps: {:?}", gaps);
                if let Some(&last) = gaps.last() {
                    assert!(last <= max_seg + 1e-9, "trailing gap exceeds max: {last}");
                }
            }
        }
    }

    #[test]
    fn empty_iframes_uniformly_divides() {
        let b = plan(&[], 100.0, 3.5, 1.25);
        let gaps: Vec<f64> = b.windows(2).map(|w| w[1] - w[0]).collect();
        let first = gaps[0];
        for g in &gaps {
            assert!(approx_eq(*g, first));
        }
        assert!(first <= 3.5 + 1.25 + 1e-9);
    }

    #[test]
    fn tiny_duration_is_tolerated_exception() {
        // duration itself is shorter than min_seg: single short segment.
        let b = plan(&[], 1.0, 3.5, 1.25);
        assert_eq!(b, vec![0.0, 1.0]);
    }
}
