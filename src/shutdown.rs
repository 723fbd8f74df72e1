//! Señal de parada compartida entre el bucle principal y los hilos.
//!
//! Al disparar la señal se suelta el único `Sender`, con lo que todos los
//! `Receiver` clonados quedan desconectados y despiertan a la vez.

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

pub struct ShutdownSignal {
    sender: Mutex<Option<Sender<()>>>,
}

#[derive(Clone)]
pub struct ShutdownListener {
    receiver: Receiver<()>,
}

pub fn shutdown_channel() -> (ShutdownSignal, ShutdownListener) {
    let (tx, rx) = flume::bounded(1);
    (
        ShutdownSignal {
            sender: Mutex::new(Some(tx)),
        },
        ShutdownListener { receiver: rx },
    )
}

impl ShutdownSignal {
    /// Idempotente.
    pub fn trigger(&self) {
        self.sender.lock().take();
    }
}

impl ShutdownListener {
    /// Espera hasta `timeout`; devuelve `true` si se pidió la parada.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) | Ok(()) => false,
        }
    }
}
