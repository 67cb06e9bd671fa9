pub mod camera;
pub mod focuser;
pub mod mount;
pub mod wheel;

pub use camera::Camera;
pub use focuser::Focuser;
pub use mount::{GuideDirection, Mount};
pub use wheel::FilterWheel;

/// Equatorial coordinates of date: right ascension in hours, declination
/// in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EquatorialCoordinates {
    pub right_ascension: f64,
    pub declination: f64,
}

impl EquatorialCoordinates {
    /// Tolerance below which two positions count as the same pointing.
    pub const EPSILON: f64 = 1e-6;

    pub fn new(right_ascension: f64, declination: f64) -> Self {
        Self { right_ascension, declination }
    }

    pub fn approx_eq(&self, other: &Self) -> bool {
        (self.right_ascension - other.right_ascension).abs() < Self::EPSILON
            && (self.declination - other.declination).abs() < Self::EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_eq_tolerates_rounding_noise() {
        let a = EquatorialCoordinates::new(5.5, 45.0);
        let b = EquatorialCoordinates::new(5.5 + 1e-9, 45.0 - 1e-9);
        let c = EquatorialCoordinates::new(5.6, 45.0);
        assert!(a.approx_eq(&b));
        assert!(!a.approx_eq(&c));
    }
}
