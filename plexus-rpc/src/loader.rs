//! Dynamic proxy-stub library loading.
//!
//! At startup (or on a `Setup.proxy_stub_path` announce reply) a process
//! scans a directory for shared libraries and loads each one once. A library
//! exports a single registration entry point that hands its proxy/stub
//! pairs to the administrator. Libraries stay resident until the
//! administrator itself is torn down, after the tables that may reference
//! their code.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::administrator::Administrator;
use crate::stub::ProxyStubPair;

/// Symbol every proxy-stub library exports.
///
/// ```c
/// void plexus_proxy_stub_entry(Registration *registration);
/// ```
pub const PROXY_STUB_ENTRY_POINT: &[u8] = b"plexus_proxy_stub_entry\0";

type EntryPoint = unsafe extern "C" fn(&mut Registration);

/// Collects the proxy/stub pairs a library wants to register.
#[derive(Debug, Default)]
pub struct Registration {
    pairs: Vec<ProxyStubPair>,
}

impl Registration {
    /// Registers one interface's glue.
    pub fn register(&mut self, pair: ProxyStubPair) {
        self.pairs.push(pair);
    }
}

/// A resident proxy-stub library.
#[derive(Debug)]
pub(crate) struct LoadedLibrary {
    path: Utf8PathBuf,
    _library: libloading::Library,
}

/// Scans `directory` for `*.so` proxy-stub libraries and registers their
/// interfaces with `administrator`.
///
/// Each library is loaded once per process; a library that fails to load or
/// lacks the entry point is logged and skipped, it must not take the host
/// down. Returns the number of newly registered pairs.
pub fn load_proxy_stubs(
    administrator: &Arc<Administrator>,
    directory: &Utf8Path,
) -> std::io::Result<usize> {
    let mut registered = 0;

    for entry in directory.read_dir_utf8()? {
        let entry = entry?;
        let path = entry.path();
        if path.extension() != Some("so") {
            continue;
        }

        let mut libraries = administrator.libraries.lock().expect("poisoned");
        if libraries.iter().any(|library| library.path == path) {
            continue;
        }

        // SAFETY: loading a proxy-stub library runs its initialisers; the
        // deployment contract is that only trusted plexus proxy-stub
        // libraries live in the configured directory.
        let library = match unsafe { libloading::Library::new(path.as_std_path()) } {
            Ok(library) => library,
            Err(error) => {
                tracing::warn!(%path, ?error, "skipping unloadable proxy-stub library");
                continue;
            }
        };

        // SAFETY: the entry point's signature is fixed by
        // `PROXY_STUB_ENTRY_POINT`'s contract.
        let entry_point = match unsafe { library.get::<EntryPoint>(PROXY_STUB_ENTRY_POINT) } {
            Ok(entry_point) => entry_point,
            Err(error) => {
                tracing::warn!(%path, ?error, "library has no proxy-stub entry point");
                continue;
            }
        };

        let mut registration = Registration::default();
        // SAFETY: the library promises the entry point only fills in the
        // passed registration.
        unsafe { entry_point(&mut registration) };

        tracing::info!(%path, pairs = registration.pairs.len(), "loaded proxy-stub library");
        for pair in registration.pairs {
            administrator.announce_factory(pair);
            registered += 1;
        }

        libraries.push(LoadedLibrary {
            path: path.to_owned(),
            _library: library,
        });
    }

    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let administrator = Administrator::new();
        assert!(load_proxy_stubs(&administrator, Utf8Path::new("/nonexistent/path")).is_err());
    }

    #[tokio::test]
    async fn empty_directory_registers_nothing() {
        let administrator = Administrator::new();
        let directory = tempfile::tempdir().unwrap();
        let directory = Utf8Path::from_path(directory.path()).unwrap();
        assert_eq!(load_proxy_stubs(&administrator, directory).unwrap(), 0);
    }

    #[tokio::test]
    async fn non_library_files_are_skipped() {
        let administrator = Administrator::new();
        let directory = tempfile::tempdir().unwrap();
        std::fs::write(directory.path().join("notes.txt"), b"not a library").unwrap();
        std::fs::write(directory.path().join("broken.so"), b"not elf").unwrap();

        let directory = Utf8Path::from_path(directory.path()).unwrap();
        // The broken library logs and is skipped; nothing registers.
        assert_eq!(load_proxy_stubs(&administrator, directory).unwrap(), 0);
    }
}
