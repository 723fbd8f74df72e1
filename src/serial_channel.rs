//! Canal serie: posee un único dispositivo físico de principio a fin.
//!
//! Cada transacción Modbus es estrictamente petición y luego respuesta, por
//! lo que el canal no se comparte entre peticiones concurrentes.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

use crate::config::PortConfig;
use crate::serial_utils::format_frame;

/// Intervalo de sondeo de bytes disponibles durante la recepción.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no se pudo abrir el puerto serial {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: serialport::Error,
    },

    #[error("error al escribir en el puerto serial: {0}")]
    Write(#[source] io::Error),

    #[error("error al leer del puerto serial: {0}")]
    Read(#[source] io::Error),

    #[error("sin respuesta completa en {timeout:?}: {received} de {expected} bytes")]
    Timeout {
        expected: usize,
        received: usize,
        timeout: Duration,
    },
}

/// Enlace de bytes bajo el canal. En producción es un `SerialPort`.
pub trait Transport: Read + Write + Send {
    /// Bytes que se pueden leer sin bloquear.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Descarta la entrada pendiente.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

pub struct Channel {
    name: String,
    device: String,
    response_timeout: Duration,
    link: Box<dyn Transport>,
}

impl Channel {
    /// Abre y configura el dispositivo en modo crudo.
    pub fn open(port: &PortConfig) -> Result<Self, ChannelError> {
        let serial = serialport::new(&port.device, port.baud_rate)
            .data_bits(port.data_bits)
            .parity(port.parity)
            .stop_bits(port.stop_bits)
            .flow_control(serialport::FlowControl::None)
            // Solo se lee lo que ya está disponible; el timeout acota las escrituras
            .timeout(port.timeout())
            .open()
            .map_err(|source| ChannelError::Open {
                device: port.device.clone(),
                source,
            })?;

        info!(
            "🔌 Puerto {} abierto en {} ({} baudios)",
            port.name, port.device, port.baud_rate
        );
        Ok(Self::from_transport(
            &port.name,
            &port.device,
            port.timeout(),
            Box::new(serial),
        ))
    }

    pub fn from_transport(
        name: &str,
        device: &str,
        response_timeout: Duration,
        link: Box<dyn Transport>,
    ) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            response_timeout,
            link,
        }
    }

    /// Tiempo máximo de espera de una respuesta completa.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Envía la trama completa y espera a que salga del buffer de salida.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        // Restos de una respuesta tardía no deben mezclarse con la siguiente
        self.link.discard_input().map_err(ChannelError::Write)?;

        let link = &mut self.link;
        link.write_all(frame)
            .and_then(|_| link.flush())
            .map_err(ChannelError::Write)?;

        debug!("📤 [{}] TX {}", self.name, format_frame(frame));
        Ok(())
    }

    /// Acumula exactamente `expected_len` bytes o falla por timeout.
    ///
    /// Los datos parciales recibidos antes del timeout se descartan.
    pub fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut recibidos = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 256];

        while recibidos.len() < expected_len {
            let available = self.link.bytes_available().map_err(ChannelError::Read)?;
            if available > 0 {
                let want = (expected_len - recibidos.len()).min(available).min(chunk.len());
                match self.link.read(&mut chunk[..want]) {
                    Ok(n) if n > 0 => {
                        recibidos.extend_from_slice(&chunk[..n]);
                        continue;
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(ChannelError::Read(e)),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "🧩 [{}] descartando respuesta parcial: {}",
                    self.name,
                    format_frame(&recibidos)
                );
                return Err(ChannelError::Timeout {
                    expected: expected_len,
                    received: recibidos.len(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }

        debug!("📥 [{}] RX {}", self.name, format_frame(&recibidos));
        Ok(recibidos)
    }

    /// Libera el dispositivo. `Drop` hace lo mismo en cualquier otra salida.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        info!("🔒 Cerrando puerto {} ({})", self.name, self.device);
    }
}
