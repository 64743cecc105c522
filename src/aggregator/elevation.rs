//! Elevation gain/loss over a route

use crate::types::{LocationSample, RoutePoint};

/// Accumulates elevation change from successive fixes.
///
/// Fixes with an invalid altitude are skipped and do not reset the reference
/// altitude, so a gap in vertical accuracy does not lose the climb across it.
#[derive(Debug, Clone, Default)]
pub struct ElevationAccumulator {
    last_altitude: Option<f64>,
    gain: f64,
    loss: f64,
    points: Vec<RoutePoint>,
}

impl ElevationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fix: &LocationSample) {
        let altitude = fix.has_valid_altitude().then_some(fix.altitude);
        self.points.push(RoutePoint {
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp: fix.timestamp,
            altitude,
        });

        let Some(altitude) = altitude else {
            return;
        };
        if let Some(last) = self.last_altitude {
            let delta = altitude - last;
            if delta > 0.0 {
                self.gain += delta;
            } else {
                self.loss -= delta;
            }
        }
        self.last_altitude = Some(altitude);
    }

    pub fn extend<'a>(&mut self, fixes: impl IntoIterator<Item = &'a LocationSample>) {
        for fix in fixes {
            self.push(fix);
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn into_route(self) -> RouteSummary {
        RouteSummary {
            points: self.points,
            elevation_gain_m: self.gain,
            elevation_loss_m: self.loss,
        }
    }
}

/// Route points and elevation totals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteSummary {
    pub points: Vec<RoutePoint>,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
}
