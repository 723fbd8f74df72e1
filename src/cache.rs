//! Caché local de escritura anticipada (SQLite) delante del almacenamiento.
//!
//! Toda lectura se guarda primero en `data_cache` y solo se borra cuando el
//! destino confirma la escritura. Las filas que se están enviando quedan
//! reservadas en `in_flight`, así la llamada al destino se hace sin tener
//! bloqueada la cola y una fila nunca se envía dos veces a la vez.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::SecondsFormat;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use thiserror::Error;

use crate::config::CacheConfig;
use crate::reading::{timestamp_from_millis, Reading};
use crate::sink::StorageSink;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS data_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sensor_name TEXT NOT NULL,
        slave_id INTEGER NOT NULL,
        temperature REAL NOT NULL,
        humidity REAL NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_cache_retry ON data_cache(retry_count);
";

const SELECT_COLUMNS: &str =
    "SELECT id, sensor_name, slave_id, temperature, humidity, timestamp_ms, retry_count FROM data_cache";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("error en la caché local: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("error exportando entradas agotadas: {0}")]
    Export(#[from] csv::Error),

    #[error("error de E/S en la caché: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub batch_size: usize,
    pub max_retry: u32,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retry: config.max_retry,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retry: 10,
        }
    }
}

/// Una fila de `data_cache`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: i64,
    pub reading: Reading,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: u64,
    /// Entradas que el flush todavía reintentará.
    pub pending: u64,
    /// Entradas que agotaron `max_retry`; solo salen con una exportación.
    pub exhausted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// El destino confirmó y la fila ya se borró.
    Delivered,
    /// Queda en la caché para el siguiente flush.
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub stats: CacheStats,
}

struct Queue {
    conn: Connection,
    in_flight: HashSet<i64>,
}

struct Shared {
    settings: CacheSettings,
    queue: Mutex<Queue>,
    sink: Mutex<Box<dyn StorageSink>>,
}

/// Manejador compartido; los clones apuntan a la misma caché.
#[derive(Clone)]
pub struct CacheBuffer {
    shared: Arc<Shared>,
}

impl CacheBuffer {
    pub fn open(
        path: &Path,
        sink: Box<dyn StorageSink>,
        settings: CacheSettings,
    ) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Caché {} en modo {}", path.display(), mode);
        conn.execute_batch(SCHEMA)?;

        let cache = Self {
            shared: Arc::new(Shared {
                settings,
                queue: Mutex::new(Queue {
                    conn,
                    in_flight: HashSet::new(),
                }),
                sink: Mutex::new(sink),
            }),
        };

        let stats = cache.stats()?;
        info!(
            "🗃️ Caché abierta en {}: {} pendientes, {} agotadas",
            path.display(),
            stats.pending,
            stats.exhausted
        );
        Ok(cache)
    }

    /// Guarda la lectura y hace un intento inmediato de envío.
    ///
    /// Un fallo del destino no es un error: la lectura queda en la caché.
    /// Si el flush está usando el destino no se espera, la lectura queda
    /// encolada para el siguiente ciclo.
    pub fn ingest(&self, reading: &Reading) -> Result<IngestOutcome, CacheError> {
        let ids = self.insert_claimed(std::slice::from_ref(reading))?;
        let (delivered, failed) = self.forward_if_idle(&ids, std::slice::from_ref(reading));
        self.settle(&delivered, &failed, false)?;

        Ok(if delivered.is_empty() {
            IngestOutcome::Queued
        } else {
            IngestOutcome::Delivered
        })
    }

    /// Igual que `ingest` para varias lecturas con una sola transacción.
    pub fn ingest_batch(&self, readings: &[Reading]) -> Result<usize, CacheError> {
        if readings.is_empty() {
            return Ok(0);
        }
        let ids = self.insert_claimed(readings)?;
        let (delivered, failed) = self.forward_if_idle(&ids, readings);
        self.settle(&delivered, &failed, false)?;
        Ok(delivered.len())
    }

    /// Un ciclo del flush: reenvía hasta `batch_size` entradas pendientes.
    pub fn flush_tick(&self) -> Result<FlushReport, CacheError> {
        let entries = self.claim_pending()?;
        if entries.is_empty() {
            return Ok(FlushReport {
                stats: self.stats()?,
                ..FlushReport::default()
            });
        }

        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        let readings: Vec<Reading> = entries.into_iter().map(|e| e.reading).collect();
        let (delivered, failed) = {
            let mut sink = self.shared.sink.lock();
            forward(&mut **sink, &ids, &readings)
        };
        self.settle(&delivered, &failed, true)?;

        let report = FlushReport {
            attempted: ids.len(),
            delivered: delivered.len(),
            failed: failed.len(),
            stats: self.stats()?,
        };
        info!(
            "🔁 Flush de caché: {} enviadas, {} fallidas, {} pendientes",
            report.delivered, report.failed, report.stats.pending
        );
        if report.stats.exhausted > 0 {
            warn!(
                "⚠️ {} entradas agotaron {} reintentos y esperan exportación",
                report.stats.exhausted, self.shared.settings.max_retry
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let queue = self.shared.queue.lock();
        let (total, pending): (i64, i64) = queue.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN retry_count < ?1 THEN 1 ELSE 0 END), 0)
             FROM data_cache",
            params![self.shared.settings.max_retry],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total = total.max(0) as u64;
        let pending = pending.max(0) as u64;
        Ok(CacheStats {
            total,
            pending,
            exhausted: total - pending,
        })
    }

    /// Entradas pendientes más antiguas, sin reservarlas.
    pub fn pending_entries(&self, limit: usize) -> Result<Vec<CacheEntry>, CacheError> {
        let queue = self.shared.queue.lock();
        let mut stmt = queue.conn.prepare(&format!(
            "{} WHERE retry_count < ?1 ORDER BY id LIMIT ?2",
            SELECT_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![self.shared.settings.max_retry, limit], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Entradas que agotaron los reintentos.
    pub fn dead_letters(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let queue = self.shared.queue.lock();
        dead_letters(&queue.conn, self.shared.settings.max_retry)
    }

    /// Exporta a CSV las entradas agotadas y las borra en la misma transacción.
    ///
    /// Si la escritura del CSV falla no se borra nada.
    pub fn export_dead_letters(&self, path: &Path) -> Result<usize, CacheError> {
        let max_retry = self.shared.settings.max_retry;
        let mut queue = self.shared.queue.lock();
        let tx = queue.conn.transaction()?;

        let entries = dead_letters(&tx, max_retry)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "id",
            "timestamp",
            "sensor_name",
            "slave_id",
            "temperature",
            "humidity",
            "retry_count",
        ])?;
        for entry in &entries {
            writer.write_record([
                entry.id.to_string(),
                entry
                    .reading
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                entry.reading.sensor_name.clone(),
                entry.reading.slave_id.to_string(),
                entry.reading.temperature.to_string(),
                entry.reading.humidity.to_string(),
                entry.retry_count.to_string(),
            ])?;
        }
        writer.flush()?;

        {
            let mut delete = tx.prepare_cached("DELETE FROM data_cache WHERE id = ?1")?;
            for entry in &entries {
                delete.execute(params![entry.id])?;
            }
        }
        tx.commit()?;

        info!(
            "📤 {} entradas agotadas exportadas a {}",
            entries.len(),
            path.display()
        );
        Ok(entries.len())
    }

    /// Cierra el destino. La base de la caché se cierra al soltar el último clon.
    pub fn close(&self) {
        match self.stats() {
            Ok(stats) if stats.total > 0 => info!(
                "🗃️ Quedan {} entradas en caché ({} agotadas)",
                stats.total, stats.exhausted
            ),
            Ok(_) => {}
            Err(e) => warn!("⚠️ No se pudo consultar la caché al cerrar: {}", e),
        }

        let mut sink = self.shared.sink.lock();
        if let Err(e) = sink.close() {
            warn!("⚠️ Error cerrando almacenamiento {}: {}", sink.kind(), e);
        }
    }

    fn insert_claimed(&self, readings: &[Reading]) -> Result<Vec<i64>, CacheError> {
        let mut guard = self.shared.queue.lock();
        let Queue { conn, in_flight } = &mut *guard;

        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(readings.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO data_cache (sensor_name, slave_id, temperature, humidity, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for reading in readings {
                insert.execute(params![
                    reading.sensor_name,
                    reading.slave_id,
                    reading.temperature,
                    reading.humidity,
                    reading.timestamp_millis(),
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;

        in_flight.extend(ids.iter().copied());
        Ok(ids)
    }

    fn claim_pending(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let settings = self.shared.settings;
        let mut guard = self.shared.queue.lock();
        let Queue { conn, in_flight } = &mut *guard;

        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE retry_count < ?1 ORDER BY id",
            SELECT_COLUMNS
        ))?;
        let mut entries = Vec::new();
        for entry in stmt.query_map(params![settings.max_retry], entry_from_row)? {
            let entry = entry?;
            if in_flight.contains(&entry.id) {
                continue;
            }
            entries.push(entry);
            if entries.len() >= settings.batch_size {
                break;
            }
        }

        in_flight.extend(entries.iter().map(|e| e.id));
        Ok(entries)
    }

    /// Envío inmediato de la ingesta; nunca espera al hilo de flush.
    fn forward_if_idle(&self, ids: &[i64], readings: &[Reading]) -> (Vec<i64>, Vec<i64>) {
        match self.shared.sink.try_lock() {
            Some(mut sink) => forward(&mut **sink, ids, readings),
            None => {
                debug!(
                    "Destino ocupado por el flush, {} lecturas quedan en caché",
                    readings.len()
                );
                (Vec::new(), ids.to_vec())
            }
        }
    }

    /// Borra las enviadas y, si `bump_retry`, incrementa las fallidas; una transacción.
    fn settle(&self, delivered: &[i64], failed: &[i64], bump_retry: bool) -> Result<(), CacheError> {
        let mut guard = self.shared.queue.lock();
        let Queue { conn, in_flight } = &mut *guard;

        for id in delivered.iter().chain(failed) {
            in_flight.remove(id);
        }

        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare_cached("DELETE FROM data_cache WHERE id = ?1")?;
            for id in delivered {
                delete.execute(params![id])?;
            }
            if bump_retry {
                let mut bump = tx.prepare_cached(
                    "UPDATE data_cache SET retry_count = retry_count + 1 WHERE id = ?1",
                )?;
                for id in failed {
                    bump.execute(params![id])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Envía al destino sin tener la cola bloqueada. Devuelve (enviadas, fallidas).
fn forward(sink: &mut dyn StorageSink, ids: &[i64], readings: &[Reading]) -> (Vec<i64>, Vec<i64>) {
    if readings.len() > 1 && sink.supports_batch() {
        match sink.save_batch(readings) {
            Ok(()) => return (ids.to_vec(), Vec::new()),
            Err(e) => warn!(
                "⚠️ Lote de {} lecturas rechazado por {}, se reintenta una a una: {}",
                readings.len(),
                sink.kind(),
                e
            ),
        }
    }

    let mut delivered = Vec::new();
    let mut failed = Vec::new();
    for (id, reading) in ids.iter().zip(readings) {
        match sink.save(reading) {
            Ok(()) => delivered.push(*id),
            Err(e) => {
                debug!(
                    "Entrada {} ({}) no enviada a {}: {}",
                    id,
                    reading.sensor_name,
                    sink.kind(),
                    e
                );
                failed.push(*id);
            }
        }
    }
    (delivered, failed)
}

fn dead_letters(conn: &Connection, max_retry: u32) -> Result<Vec<CacheEntry>, CacheError> {
    let mut stmt = conn.prepare_cached(&format!(
        "{} WHERE retry_count >= ?1 ORDER BY id",
        SELECT_COLUMNS
    ))?;
    let entries = stmt
        .query_map(params![max_retry], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let sensor_name: String = row.get(1)?;
    Ok(CacheEntry {
        id: row.get(0)?,
        reading: Reading::with_timestamp(
            &sensor_name,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            timestamp_from_millis(row.get(5)?),
        ),
        retry_count: row.get(6)?,
    })
}
