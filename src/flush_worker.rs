//! Hilo de fondo que vacía la caché hacia el almacenamiento.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::cache::CacheBuffer;
use crate::shutdown::ShutdownListener;

pub struct FlushWorker {
    handle: JoinHandle<()>,
}

/// Lanza el hilo `cache-flush`: un `flush_tick` cada `interval` hasta la señal de parada.
///
/// La señal solo se observa entre ciclos, nunca a mitad de una transacción.
pub fn spawn_flush_worker(
    cache: CacheBuffer,
    interval: Duration,
    shutdown: ShutdownListener,
) -> io::Result<FlushWorker> {
    let handle = thread::Builder::new()
        .name("cache-flush".to_string())
        .spawn(move || {
            info!("🟡 Hilo de flush de caché iniciado (cada {:?})", interval);
            let mut fallos_seguidos = 0u32;

            loop {
                if shutdown.wait(interval) {
                    break;
                }
                match cache.flush_tick() {
                    Ok(_) => fallos_seguidos = 0,
                    Err(e) => {
                        fallos_seguidos += 1;
                        if fallos_seguidos == 1 {
                            error!("❌ Error en flush de caché: {}", e);
                        } else {
                            warn!("⚠️ Flush de caché sigue fallando ({}): {}", fallos_seguidos, e);
                        }
                    }
                }
            }

            info!("🛑 Hilo de flush de caché detenido");
        })?;
    Ok(FlushWorker { handle })
}

impl FlushWorker {
    /// Espera a que termine el ciclo en curso.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("❌ El hilo de flush de caché terminó con pánico");
        }
    }
}
