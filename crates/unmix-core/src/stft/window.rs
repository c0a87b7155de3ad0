//! Analysis/synthesis windows for weighted overlap-add

use std::f32::consts::PI;

/// Window shape chosen for a (window, hop) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Periodic Hann, used when frames overlap by at least half
    Hann,
    /// Flat top with sine tapers of `taper` samples; the tapers of adjacent
    /// frames are power-complementary (sin² + cos² = 1)
    SineTaper { taper: usize },
}

impl WindowKind {
    /// Pick the window for a hop size
    ///
    /// Hann needs at least 50% overlap to keep the summed squared window
    /// bounded away from zero. Sparser hops use a taper exactly as long as
    /// the overlap, which degenerates to rectangular at `hop == window`.
    pub fn for_hop(window_size: usize, hop_size: usize) -> Self {
        if hop_size * 2 <= window_size {
            WindowKind::Hann
        } else {
            WindowKind::SineTaper {
                taper: window_size - hop_size,
            }
        }
    }

    /// Generate the window coefficients
    pub fn coefficients(&self, size: usize) -> Vec<f32> {
        match *self {
            WindowKind::Hann => hann(size),
            WindowKind::SineTaper { taper } => sine_taper(size, taper),
        }
    }
}

/// Periodic Hann window
pub fn hann(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let phase = 2.0 * PI * i as f32 / size as f32;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Flat-top window with quarter-sine tapers at both ends
fn sine_taper(size: usize, taper: usize) -> Vec<f32> {
    let taper = taper.min(size / 2);
    let mut window = vec![1.0f32; size];
    if taper == 0 {
        return window;
    }
    for i in 0..taper {
        let phase = 0.5 * PI * (i as f32 + 0.5) / taper as f32;
        window[i] = phase.sin();
        window[size - taper + i] = phase.cos();
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_shape() {
        let window = hann(8);
        assert!(window[0].abs() < 1e-7);
        assert!((window[4] - 1.0).abs() < 1e-6);
        assert!((window[2] - window[6]).abs() < 1e-6);
    }

    #[test]
    fn test_kind_selection() {
        assert_eq!(WindowKind::for_hop(1024, 256), WindowKind::Hann);
        assert_eq!(WindowKind::for_hop(1024, 512), WindowKind::Hann);
        assert_eq!(WindowKind::for_hop(1024, 768), WindowKind::SineTaper { taper: 256 });
        assert_eq!(WindowKind::for_hop(1024, 1024), WindowKind::SineTaper { taper: 0 });
    }

    #[test]
    fn test_sine_taper_power_complementary() {
        let size = 64;
        let hop = 48;
        let window = WindowKind::for_hop(size, hop).coefficients(size);
        // Falling taper of one frame overlaps the rising taper of the next
        for i in 0..size - hop {
            let sum = window[hop + i].powi(2) + window[i].powi(2);
            assert!((sum - 1.0).abs() < 1e-6, "sum at {} was {}", i, sum);
        }
    }

    #[test]
    fn test_rectangular_when_no_overlap() {
        let window = WindowKind::for_hop(16, 16).coefficients(16);
        assert!(window.iter().all(|&w| w == 1.0));
    }
}
