pub mod meter;
pub mod plant;
pub mod realtime;

pub use meter::Meter;
pub use plant::Plant;
pub use realtime::{RealtimeDataPoint, RealtimePowerRow};

pub type MeterId = i64;
pub type PlantId = i64;

/// Minimal projection of a plant or meter used by the nearest-meter job.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct SiteLocation {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

impl SiteLocation {
    pub fn has_valid_coordinates(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_location_rejects_out_of_range_and_nan() {
        let ok = SiteLocation { id: 1, lat: 47.0, lon: 8.0 };
        assert!(ok.has_valid_coordinates());
        assert!(!SiteLocation { lat: 91.0, ..ok }.has_valid_coordinates());
        assert!(!SiteLocation { lon: -180.5, ..ok }.has_valid_coordinates());
        assert!(!SiteLocation { lat: f64::NAN, ..ok }.has_valid_coordinates());
    }
}
