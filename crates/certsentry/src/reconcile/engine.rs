//! Disk reconciliation engine.
//!
//! Decides, per managed file, whether the on-disk content is missing or
//! stale relative to the in-memory certificate material, writes only what
//! needs writing, and notifies dependent containers when anything changed.
//! Write failures are recorded but never abort the remaining files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::config::{Config, PfxFileConfig};
use crate::containers::ContainerNotifier;
use crate::reconcile::pfx::{PfxEncoder, PfxVariant};
use crate::store::{leaf_not_after, CertificateStore};

/// Filename of the private key PEM within the storage directory
pub const KEY_PEM_FILENAME: &str = "key.pem";

/// Filename of the certificate chain PEM within the storage directory
pub const CERT_CHAIN_FILENAME: &str = "certchain.pem";

/// Where and how certificate files are laid out on disk
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Directory all files live in
    pub dir: PathBuf,
    /// Unix mode for key-bearing files
    pub key_mode: u32,
    /// Unix mode for cert-only files
    pub cert_mode: u32,
    /// Modern PKCS12 output, when enabled
    pub pfx: Option<PfxFileConfig>,
    /// Legacy PKCS12 output, when enabled
    pub legacy_pfx: Option<PfxFileConfig>,
}

impl StorageLayout {
    /// Derive the layout from the agent configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.storage_dir.clone(),
            key_mode: config.key_mode,
            cert_mode: config.cert_mode,
            pfx: config.pfx.clone(),
            legacy_pfx: config.legacy_pfx.clone(),
        }
    }

    /// Path of the private key PEM
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_PEM_FILENAME)
    }

    /// Path of the certificate chain PEM
    pub fn certchain_path(&self) -> PathBuf {
        self.dir.join(CERT_CHAIN_FILENAME)
    }
}

/// Existence and staleness of one managed file
#[derive(Debug, Clone, Copy)]
struct FileState {
    exists: bool,
    stale: bool,
}

/// Writes missing or stale certificate files and restarts dependents
pub struct ReconciliationEngine {
    store: Arc<CertificateStore>,
    layout: StorageLayout,
    encoder: Box<dyn PfxEncoder>,
    notifier: Option<ContainerNotifier>,
}

impl ReconciliationEngine {
    /// Create an engine over the given store and disk layout
    pub fn new(
        store: Arc<CertificateStore>,
        layout: StorageLayout,
        encoder: Box<dyn PfxEncoder>,
        notifier: Option<ContainerNotifier>,
    ) -> Self {
        Self {
            store,
            layout,
            encoder,
            notifier,
        }
    }

    /// Bring the on-disk files in line with the stored material.
    ///
    /// With `only_if_missing` set (used right after a successful fetch),
    /// stale-but-present files are rewritten only when some other enabled
    /// file is already absent: in that case dependents are presumed broken
    /// and cannot wait for the maintenance window. Each write is attempted
    /// independently; a failure is logged and the remaining files are still
    /// tried.
    ///
    /// Returns `true` when the disk still needs an update: some stale
    /// content was left unwritten this pass, or a write attempt failed.
    pub async fn reconcile(&self, only_if_missing: bool) -> bool {
        let Some((key_pem, cert_pem)) = self.store.read() else {
            debug!("no certificate material in memory, nothing to reconcile");
            return false;
        };

        let key_state = self.pem_file_state(&self.layout.key_path(), &key_pem, false);
        let cert_state = self.pem_file_state(&self.layout.certchain_path(), &cert_pem, true);

        let pfx_exists = self
            .layout
            .pfx
            .as_ref()
            .map(|p| self.layout.dir.join(&p.filename).exists());
        let legacy_pfx_exists = self
            .layout
            .legacy_pfx
            .as_ref()
            .map(|p| self.layout.dir.join(&p.filename).exists());

        let any_missing = !key_state.exists
            || !cert_state.exists
            || pfx_exists == Some(false)
            || legacy_pfx_exists == Some(false);

        // derived formats are stale whenever the pem they came from is stale
        let pem_stale = key_state.stale || cert_state.stale;

        // stale-but-present files defer to the window unless forced
        let force_stale = !only_if_missing || any_missing;

        let mut wrote_any = false;
        let mut failed_any = false;
        let mut stale_skipped = false;

        if !key_state.exists || (key_state.stale && force_stale) {
            match write_file(&self.layout.key_path(), &key_pem, self.layout.key_mode) {
                Ok(()) => {
                    info!("wrote new key.pem file");
                    wrote_any = true;
                }
                Err(e) => {
                    error!(error = %e, "failed to write key.pem");
                    failed_any = true;
                }
            }
        } else if key_state.stale {
            stale_skipped = true;
        }

        if !cert_state.exists || (cert_state.stale && force_stale) {
            match write_file(
                &self.layout.certchain_path(),
                &cert_pem,
                self.layout.cert_mode,
            ) {
                Ok(()) => {
                    info!("wrote new certchain.pem file");
                    wrote_any = true;
                }
                Err(e) => {
                    error!(error = %e, "failed to write certchain.pem");
                    failed_any = true;
                }
            }
        } else if cert_state.stale {
            stale_skipped = true;
        }

        for (pfx_config, exists, variant) in [
            (self.layout.pfx.as_ref(), pfx_exists, PfxVariant::Modern),
            (
                self.layout.legacy_pfx.as_ref(),
                legacy_pfx_exists,
                PfxVariant::Legacy,
            ),
        ] {
            let Some(pfx_config) = pfx_config else {
                continue;
            };
            let exists = exists == Some(true);

            if !exists || (pem_stale && force_stale) {
                match self.write_pfx(variant, pfx_config, &key_pem, &cert_pem) {
                    Ok(()) => {
                        info!(file = %pfx_config.filename, variant = ?variant, "wrote new pfx file");
                        wrote_any = true;
                    }
                    Err(e) => {
                        error!(file = %pfx_config.filename, error = %e, "failed to write pfx file");
                        failed_any = true;
                    }
                }
            } else if pem_stale {
                stale_skipped = true;
            }
        }

        if let Some(notifier) = &self.notifier {
            if wrote_any {
                info!("at least one file changed, notifying containers");
                notifier.notify_all().await;
            } else {
                debug!("no file changes, containers left alone");
            }
        }

        info!("key/cert file reconciliation complete");

        stale_skipped || failed_any
    }

    /// Existence/staleness of a PEM file relative to the wanted bytes.
    ///
    /// Unreadable files count as absent. When `demote_expired` is set, a
    /// differing file whose content no longer parses as an unexpired
    /// certificate also counts as absent, forcing an immediate rewrite.
    fn pem_file_state(&self, path: &Path, want: &[u8], demote_expired: bool) -> FileState {
        if !path.exists() {
            return FileState {
                exists: false,
                stale: false,
            };
        }

        let have = match fs::read(path) {
            Ok(have) => have,
            Err(e) => {
                error!(path = %path.display(), error = %e, "could not read file, treating as absent");
                return FileState {
                    exists: false,
                    stale: false,
                };
            }
        };

        if have == want {
            return FileState {
                exists: true,
                stale: false,
            };
        }

        let mut exists = true;
        if demote_expired {
            match leaf_not_after(&have) {
                Ok(not_after) if not_after > Utc::now() => {}
                Ok(_) => {
                    debug!(path = %path.display(), "on-disk certificate expired, treating as absent");
                    exists = false;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "on-disk certificate unparseable, treating as absent");
                    exists = false;
                }
            }
        }

        FileState { exists, stale: true }
    }

    fn write_pfx(
        &self,
        variant: PfxVariant,
        pfx_config: &PfxFileConfig,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> anyhow::Result<()> {
        let der = self
            .encoder
            .encode(variant, key_pem, cert_pem, &pfx_config.password)?;
        // pfx contains the private key, so it gets the key mode
        write_file(
            &self.layout.dir.join(&pfx_config.filename),
            &der,
            self.layout.key_mode,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("layout", &self.layout)
            .field("has_notifier", &self.notifier.is_some())
            .finish()
    }
}

/// Write a file and set its unix mode
fn write_file(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    fs::write(path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
