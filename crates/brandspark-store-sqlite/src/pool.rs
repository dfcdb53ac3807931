//! A small fixed-size pool of `tokio-rusqlite` connections.

use std::{
  path::PathBuf,
  sync::atomic::{AtomicUsize, Ordering},
  time::Duration,
};

use tokio_rusqlite::Connection;

use crate::{
  Error, Result,
  schema::{CONNECTION_PRAGMAS, FILE_PRAGMAS, SCHEMA},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the database lives, parsed from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
  Memory,
  File(PathBuf),
}

impl DatabaseTarget {
  /// Accepts `sqlite://<path>`, `sqlite:<path>`, a bare path, or `:memory:`.
  pub fn parse(url: &str) -> Result<Self> {
    let url = url.trim();
    let path = url
      .strip_prefix("sqlite://")
      .or_else(|| url.strip_prefix("sqlite:"))
      .unwrap_or(url);

    if path.is_empty() {
      return Err(Error::InvalidUrl(url.to_owned()));
    }
    if path == ":memory:" {
      return Ok(Self::Memory);
    }
    if path.contains("://") {
      return Err(Error::InvalidUrl(url.to_owned()));
    }
    Ok(Self::File(PathBuf::from(path)))
  }
}

/// Connections handed out round-robin. Each connection owns one background
/// thread, so statements on different connections run in parallel while
/// statements on one connection are serialised.
pub(crate) struct Pool {
  conns: Vec<Connection>,
  next:  AtomicUsize,
}

impl Pool {
  /// Open `size` connections (one for in-memory databases) and initialise
  /// the schema on the first.
  pub async fn open(target: &DatabaseTarget, size: usize) -> Result<Self> {
    let size = match target {
      DatabaseTarget::Memory => 1,
      DatabaseTarget::File(_) => size.max(1),
    };

    let mut conns = Vec::with_capacity(size);
    for index in 0..size {
      let conn = match target {
        DatabaseTarget::Memory => Connection::open_in_memory().await?,
        DatabaseTarget::File(path) => Connection::open(path).await?,
      };
      let first = index == 0;
      let file = matches!(target, DatabaseTarget::File(_));

      conn
        .call(move |conn| {
          conn.busy_timeout(BUSY_TIMEOUT)?;
          conn.execute_batch(CONNECTION_PRAGMAS)?;
          if first {
            if file {
              conn.execute_batch(FILE_PRAGMAS)?;
            }
            conn.execute_batch(SCHEMA)?;
          }
          Ok(())
        })
        .await?;
      conns.push(conn);
    }

    tracing::debug!(size, ?target, "opened sqlite pool");
    Ok(Self { conns, next: AtomicUsize::new(0) })
  }

  pub fn get(&self) -> Connection {
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
    self.conns[index].clone()
  }

  pub fn size(&self) -> usize { self.conns.len() }

  /// Close every connection. Errors are logged; the pool is gone either way.
  pub async fn close(self) {
    for conn in self.conns {
      if let Err(e) = conn.close().await {
        tracing::warn!(error = %e, "failed to close sqlite connection");
      }
    }
  }
}
