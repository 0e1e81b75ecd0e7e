use crate::errors::{Error, Result};
use crate::metrics::GEOLOCATION_FALLBACKS_TOTAL;
use crate::model::{Coordinates, Reading};
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const GEO_TIMEOUT: Duration = Duration::from_secs(5);

/// Uniform value in [0, 100], rounded to the nearest integer.
pub fn generate_measurement() -> f64 {
    rand::thread_rng().gen_range(0.0..=100.0_f64).round()
}

/// Fabricates sensor readings for devices that have no hardware behind them.
pub struct VirtualSensor {
    geo_url: Option<String>,
    client: Client,
}

impl VirtualSensor {
    pub fn new(geo_url: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(GEO_TIMEOUT).build()?;
        Ok(Self { geo_url, client })
    }

    /// Best-effort location lookup. Any failure yields two generated
    /// measurements in place of real coordinates.
    pub async fn geolocate(&self) -> Coordinates {
        let Some(url) = &self.geo_url else {
            return Self::fallback();
        };

        match self.fetch(url).await {
            Ok(coordinates) => coordinates,
            Err(e) => {
                warn!("Geolocation lookup failed, using fallback: {}", e);
                Self::fallback()
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Coordinates> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Geolocation(format!("HTTP {}", status)));
        }
        let coordinates: Coordinates = response.json().await?;
        debug!(
            "Geolocated at {}, {}",
            coordinates.latitude, coordinates.longitude
        );
        Ok(coordinates)
    }

    fn fallback() -> Coordinates {
        GEOLOCATION_FALLBACKS_TOTAL.inc();
        Coordinates {
            latitude: generate_measurement(),
            longitude: generate_measurement(),
        }
    }

    pub async fn read_sensors(&self) -> Reading {
        let coordinates = self.geolocate().await;
        Reading {
            temperature: generate_measurement(),
            humidity: generate_measurement(),
            pressure: generate_measurement(),
            latitude: coordinates.latitude,
            longitude: coordinates.longitude,
        }
    }
}
