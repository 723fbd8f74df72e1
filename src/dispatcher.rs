//! Enrutado de sensores a su puerto serie y agregación de resultados.
//!
//! Las lecturas son secuenciales, en el orden configurado, sin paralelismo
//! entre puertos. No hay reconexión: un puerto que no abrió al arrancar
//! queda fuera hasta reiniciar el proceso.

use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{PortConfig, SensorConfig};
use crate::error::PollError;
use crate::poller;
use crate::reading::Reading;
use crate::serial_channel::{Channel, ChannelError};

/// Resultado de un sensor en un ciclo.
#[derive(Debug)]
pub struct SensorOutcome {
    pub sensor: String,
    pub result: Result<Reading, PollError>,
}

struct PortBinding {
    config: PortConfig,
    channel: Option<Channel>,
    last_transaction: Option<Instant>,
}

pub struct Dispatcher {
    ports: Vec<PortBinding>,
    pacing: Duration,
}

impl Dispatcher {
    pub fn new(ports: Vec<PortConfig>, pacing: Duration) -> Self {
        let ports = ports
            .into_iter()
            .map(|config| PortBinding {
                config,
                channel: None,
                last_transaction: None,
            })
            .collect();
        Self { ports, pacing }
    }

    /// Abre todos los puertos; los que fallan se registran y se excluyen.
    pub fn connect_all(&mut self) -> usize {
        self.connect_all_with(Channel::open)
    }

    pub fn connect_all_with<F>(&mut self, mut open: F) -> usize
    where
        F: FnMut(&PortConfig) -> Result<Channel, ChannelError>,
    {
        for binding in &mut self.ports {
            if binding.channel.is_some() {
                continue;
            }
            match open(&binding.config) {
                Ok(channel) => {
                    info!(
                        "✅ Conectado al puerto {}: {}",
                        binding.config.name, binding.config.device
                    );
                    binding.channel = Some(channel);
                }
                Err(e) => {
                    warn!("❌ Puerto {} excluido: {}", binding.config.name, e);
                }
            }
        }
        self.connected_count()
    }

    pub fn connected_count(&self) -> usize {
        self.ports.iter().filter(|b| b.channel.is_some()).count()
    }

    pub fn is_connected(&self, port_name: &str) -> bool {
        self.ports
            .iter()
            .any(|b| b.config.name == port_name && b.channel.is_some())
    }

    /// Lee un sensor a través del canal de su puerto.
    pub fn poll_sensor(&mut self, sensor: &SensorConfig) -> Result<Reading, PollError> {
        let pacing = self.pacing;
        let binding = self
            .ports
            .iter_mut()
            .find(|b| b.config.name == sensor.port)
            .ok_or_else(|| PollError::port_not_found(&sensor.port))?;
        let channel = binding
            .channel
            .as_mut()
            .ok_or_else(|| PollError::port_unavailable(&sensor.port))?;

        // Pausa entre lecturas consecutivas del mismo bus RS-485
        if let Some(last) = binding.last_transaction {
            let elapsed = last.elapsed();
            if elapsed < pacing {
                thread::sleep(pacing - elapsed);
            }
        }

        let result = poller::read(sensor, channel);
        binding.last_transaction = Some(Instant::now());
        result
    }

    /// Lee todos los sensores en el orden configurado.
    pub fn poll_all(&mut self, sensors: &[SensorConfig]) -> Vec<SensorOutcome> {
        sensors
            .iter()
            .map(|sensor| SensorOutcome {
                sensor: sensor.name.clone(),
                result: self.poll_sensor(sensor),
            })
            .collect()
    }

    /// Cierra todos los canales abiertos.
    pub fn close_all(&mut self) {
        for binding in &mut self.ports {
            if let Some(channel) = binding.channel.take() {
                channel.close();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Registra el resultado de un ciclo, un sensor por línea.
pub fn log_outcomes(outcomes: &[SensorOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(reading) => info!(
                "  {}: temperatura={:.1}°C, humedad={:.1}%",
                outcome.sensor, reading.temperature, reading.humidity
            ),
            Err(e) => warn!("  {}: lectura fallida - {}", outcome.sensor, e),
        }
    }
}
