//! Device volume ranges.
//!
//! Renderers advertise their volume range in the RenderingControl SCPD;
//! 0–100 is common but far from universal. All user-facing values are
//! 0–100 and converted at the session boundary.

/// Inclusive device volume range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeRange {
    pub min: i64,
    pub max: i64,
}

impl Default for VolumeRange {
    fn default() -> Self {
        VolumeRange { min: 0, max: 100 }
    }
}

impl VolumeRange {
    /// Build from SCPD range strings; anything unusable falls back to
    /// 0–100.
    pub fn from_scpd(min: Option<&str>, max: Option<&str>) -> Self {
        let parsed = (
            min.and_then(|s| s.trim().parse::<i64>().ok()),
            max.and_then(|s| s.trim().parse::<i64>().ok()),
        );
        match parsed {
            (Some(min), Some(max)) if max > min => VolumeRange { min, max },
            _ => VolumeRange::default(),
        }
    }

    /// One volume step: a twentieth of the range.
    pub fn step(&self) -> i64 {
        (((self.max - self.min) as f64) / 20.0).round().max(1.0) as i64
    }

    /// Map a 0–100 user volume to the device scale.
    pub fn device_value(&self, user: u32) -> i64 {
        let user = user.min(100) as f64;
        ((self.max - self.min) as f64 * user / 100.0 + self.min as f64).round() as i64
    }

    /// Map a device volume back to the 0–100 user scale.
    pub fn user_value(&self, device: i64) -> u32 {
        let device = device.clamp(self.min, self.max);
        (((device - self.min) as f64) * 100.0 / ((self.max - self.min) as f64)).round() as u32
    }
}
