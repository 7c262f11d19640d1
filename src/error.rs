use std::{error::Error, fmt, io};

/// An error returned when the pool could not spawn a worker thread.
///
/// Spawning happens in pool construction and in
/// [`expand`](crate::TaskPool::expand). A failed `expand` keeps the workers
/// it managed to spawn; a failed construction shuts them down again.
/// [`spawned`](SpawnError::spawned) reports how many of the requested
/// threads were created before the failure.
pub struct SpawnError {
    spawned: usize,
    source: io::Error,
}

impl SpawnError {
    pub(crate) fn new(spawned: usize, source: io::Error) -> Self {
        Self { spawned, source }
    }

    /// The number of workers the failed call managed to spawn.
    pub fn spawned(&self) -> usize {
        self.spawned
    }

    /// Extracts the underlying I/O error.
    pub fn into_inner(self) -> io::Error {
        self.source
    }
}

impl Error for SpawnError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl fmt::Debug for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("spawned", &self.spawned)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not spawn worker thread after {} spawned: {}",
            self.spawned, self.source
        )
    }
}
