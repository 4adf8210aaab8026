//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Azimuth arithmetic.
//!

/// Arrival tolerance in degrees to either side of the target.
pub const AZ_TOLERANCE_DEG: f64 = 2.0;

/// Folds an azimuth into [0°, 360°).
pub fn normalize_az(mut az: f64) -> f64 {
    while az >= 360.0 { az -= 360.0; }
    while az < 0.0 { az += 360.0; }
    az
}

/// Whether `actual` is close enough to `target`, honoring the 0°/360° seam.
///
/// Both azimuths are rounded up to whole degrees before comparing, with an
/// asymmetric acceptance band: strictly more than `tolerance` below, up to
/// and including `tolerance` above. When the band straddles either side of
/// the seam the target is shifted by a full turn into the band's frame.
pub fn within_tolerance(target: f64, actual: f64, tolerance: f64) -> bool {
    let high = actual.ceil() + tolerance;
    let low = actual.ceil() - tolerance;
    let mut rounded = target.ceil();

    if low < 0.0 && high > 0.0 {
        // band straddles the seam from below
        if rounded + tolerance >= 360.0 {
            rounded = rounded + tolerance - 360.0;
        }
        low < rounded && rounded <= high
    } else if low > 0.0 && high > 360.0 {
        // band straddles the seam from above; a target just past 0° is
        // compared a full turn up, a target already inside the band as is
        (low < rounded && rounded <= high)
            || (low < rounded + 360.0 && rounded + 360.0 <= high)
    } else {
        low < rounded && rounded <= high
    }
}
