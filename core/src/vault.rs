//! Encrypted at-rest store of per-host credentials.
//!
//! The whole host map is serialized to JSON and sealed with AES-256-GCM under
//! a key derived from the operator's master password (PBKDF2-HMAC-SHA256 with
//! a random 16-byte salt stored next to the ciphertext). Plaintext passwords
//! never reach the disk.
//!
//! ## File format (v2)
//!
//! ```json
//! {
//!   "version": "2.0",
//!   "salt": "<base64, 16 bytes>",
//!   "kdf": { "algorithm": "pbkdf2-sha256", "iterations": 600000 },
//!   "data": "<base64(nonce || ciphertext)>"
//! }
//! ```
//!
//! The version, salt and iteration count are bound into the AEAD associated
//! data, so tampering with any of them fails authentication exactly like
//! tampering with the ciphertext. A wrong master password is reported as
//! [`Error::Authentication`], never as an empty store.
//!
//! ## Legacy format (v1)
//!
//! `version: "1.0"` files hold the host map as a Fernet token whose key sits in
//! a separate, unencrypted key file (urlsafe base64). They can still be opened
//! with [`Vault::open_legacy`] and converted with [`Vault::migrate`]; every
//! use logs a warning.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::fernet::FernetKey;
use crate::transport::{Endpoint, Protocol};

pub const VAULT_VERSION: &str = "2.0";
pub const LEGACY_VERSION: &str = "1.0";
pub const KDF_ALGORITHM: &str = "pbkdf2-sha256";

/// PBKDF2-HMAC-SHA256 iteration count for newly written stores (OWASP 2023).
/// Raising it re-keys existing stores on their next write.
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Count assumed for v2 files written before the `kdf` section existed.
const DEFAULT_FILE_ITERATIONS: u32 = 480_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// A string whose `Debug` output never shows the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

fn yes() -> bool {
    true
}

/// Credentials for one named host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub host_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub username: String,
    pub password: Secret,
    #[serde(default = "yes")]
    pub ssl_verify: bool,
    #[serde(default = "yes")]
    pub enabled: bool,
}

impl CredentialRecord {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            ssl_verify: self.ssl_verify,
        }
    }

    /// Rejects records `add` and `update` would refuse.
    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(Error::validation("host name must not be empty"));
        }
        if self.host_name.chars().any(char::is_whitespace) {
            return Err(Error::validation("host name must not contain whitespace"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::validation("host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::validation("port must be between 1 and 65535"));
        }
        if self.username.trim().is_empty() {
            return Err(Error::validation("username must not be empty"));
        }
        Ok(())
    }
}

/// Tunables for opening a store.
#[derive(Debug, Clone, Copy)]
pub struct VaultOptions {
    /// Iteration count used when (re-)keying.
    pub iterations: u32,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct KdfSection {
    algorithm: String,
    iterations: u32,
}

#[derive(Serialize, Deserialize)]
struct VaultFile {
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kdf: Option<KdfSection>,
    data: String,
}

enum KeyState {
    Password {
        key: [u8; KEY_LEN],
        salt: [u8; SALT_LEN],
        iterations: u32,
    },
    Legacy {
        key: FernetKey,
    },
}

struct VaultState {
    records: BTreeMap<String, CredentialRecord>,
    keys: KeyState,
}

/// The credential store. Mutations hold the write lock for the whole
/// modify-and-persist cycle; lookups share the read lock.
pub struct Vault {
    path: PathBuf,
    state: RwLock<VaultState>,
}

impl Vault {
    /// Open (or start) the store at `path` with the current KDF guidance.
    pub async fn open(path: impl Into<PathBuf>, master_password: &str) -> Result<Self> {
        Self::open_with(path, master_password, VaultOptions::default()).await
    }

    pub async fn open_with(
        path: impl Into<PathBuf>,
        master_password: &str,
        options: VaultOptions,
    ) -> Result<Self> {
        let path = path.into();
        if master_password.is_empty() {
            return Err(Error::authentication("master password must not be empty"));
        }
        if options.iterations == 0 {
            return Err(Error::configuration("PBKDF2 iteration count must be positive"));
        }

        if !tokio::fs::try_exists(&path).await? {
            tracing::info!(path = %path.display(), "creating new credential vault");
            let salt = new_salt();
            let key = derive_key(master_password, salt, options.iterations).await?;
            return Ok(Self {
                path,
                state: RwLock::new(VaultState {
                    records: BTreeMap::new(),
                    keys: KeyState::Password {
                        key,
                        salt,
                        iterations: options.iterations,
                    },
                }),
            });
        }

        let file = read_file(&path).await?;
        if file.version == LEGACY_VERSION {
            return Err(Error::configuration(format!(
                "{} is a legacy v1 vault; open it with its key file and migrate it",
                path.display()
            )));
        }
        if file.version != VAULT_VERSION {
            return Err(Error::configuration(format!(
                "unsupported vault version '{}'",
                file.version
            )));
        }

        let salt_b64 = file
            .salt
            .as_deref()
            .ok_or_else(|| Error::configuration("vault file has no salt"))?;
        let salt: [u8; SALT_LEN] = B64
            .decode(salt_b64)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::authentication("vault salt is malformed"))?;
        let iterations = match &file.kdf {
            Some(kdf) if kdf.algorithm != KDF_ALGORITHM => {
                return Err(Error::configuration(format!(
                    "unsupported KDF '{}'",
                    kdf.algorithm
                )))
            }
            Some(kdf) => kdf.iterations,
            None => DEFAULT_FILE_ITERATIONS,
        };

        let key = derive_key(master_password, salt, iterations).await?;
        let aad = associated_data(salt_b64, iterations);
        let records = unseal_records(&key, &file.data, aad.as_bytes())?;

        let keys = if iterations < options.iterations {
            tracing::info!(
                from = iterations,
                to = options.iterations,
                "vault KDF below current guidance, re-keying on next write"
            );
            let salt = new_salt();
            KeyState::Password {
                key: derive_key(master_password, salt, options.iterations).await?,
                salt,
                iterations: options.iterations,
            }
        } else {
            KeyState::Password {
                key,
                salt,
                iterations,
            }
        };

        tracing::debug!(path = %path.display(), hosts = records.len(), "vault opened");
        Ok(Self {
            path,
            state: RwLock::new(VaultState { records, keys }),
        })
    }

    /// Open a v1 store whose Fernet key lives in `key_file`.
    ///
    /// The key sits unencrypted on disk, so this is only meant for migration.
    pub async fn open_legacy(path: impl Into<PathBuf>, key_file: &Path) -> Result<Self> {
        let path = path.into();
        warn_legacy(&path);

        let key = FernetKey::from_base64(&tokio::fs::read_to_string(key_file).await?)?;

        let records = if tokio::fs::try_exists(&path).await? {
            let file = read_file(&path).await?;
            if file.version != LEGACY_VERSION {
                return Err(Error::configuration(format!(
                    "{} is not a legacy v1 vault",
                    path.display()
                )));
            }
            serde_json::from_slice(&key.decrypt(&file.data)?)
                .map_err(|e| Error::internal(format!("vault contents are not a host map: {e}")))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            state: RwLock::new(VaultState {
                records,
                keys: KeyState::Legacy { key },
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_legacy(&self) -> bool {
        matches!(self.state.read().await.keys, KeyState::Legacy { .. })
    }

    /// Add a new host. Fails if the name is taken.
    pub async fn add(&self, record: CredentialRecord) -> Result<()> {
        record.validate()?;
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.host_name) {
            return Err(Error::validation(format!(
                "host '{}' already exists",
                record.host_name
            )));
        }
        let name = record.host_name.clone();
        state.records.insert(name.clone(), record);
        if let Err(err) = self.persist_locked(&state).await {
            state.records.remove(&name);
            return Err(err);
        }
        tracing::info!(host = %name, "credential added");
        Ok(())
    }

    /// Replace an existing host's record.
    pub async fn update(&self, record: CredentialRecord) -> Result<()> {
        record.validate()?;
        let mut state = self.state.write().await;
        let name = record.host_name.clone();
        let previous = match state.records.get_mut(&name) {
            Some(slot) => std::mem::replace(slot, record),
            None => return Err(Error::not_found(format!("host '{name}'"))),
        };
        if let Err(err) = self.persist_locked(&state).await {
            state.records.insert(name, previous);
            return Err(err);
        }
        tracing::info!(host = %name, "credential updated");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let previous = state
            .records
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("host '{name}'")))?;
        if let Err(err) = self.persist_locked(&state).await {
            state.records.insert(name.to_string(), previous);
            return Err(err);
        }
        tracing::info!(host = %name, "credential removed");
        Ok(())
    }

    /// The record for `name`, password decrypted.
    pub async fn get(&self, name: &str) -> Result<CredentialRecord> {
        self.state
            .read()
            .await
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("host '{name}'")))
    }

    /// Host names, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.state.read().await.records.keys().cloned().collect()
    }

    /// Rewrite the store file.
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.write().await;
        self.persist_locked(&state).await
    }

    /// Re-key a store (legacy or current) under `master_password` and write
    /// it in the v2 format.
    pub async fn migrate(&self, master_password: &str, options: VaultOptions) -> Result<()> {
        if master_password.is_empty() {
            return Err(Error::authentication("master password must not be empty"));
        }
        let mut state = self.state.write().await;
        let salt = new_salt();
        let key = derive_key(master_password, salt, options.iterations).await?;
        let previous = std::mem::replace(
            &mut state.keys,
            KeyState::Password {
                key,
                salt,
                iterations: options.iterations,
            },
        );
        if let Err(err) = self.persist_locked(&state).await {
            state.keys = previous;
            return Err(err);
        }
        tracing::info!(path = %self.path.display(), "vault migrated to v{VAULT_VERSION}");
        Ok(())
    }

    async fn persist_locked(&self, state: &VaultState) -> Result<()> {
        let plaintext = serde_json::to_vec(&state.records)?;
        let file = match &state.keys {
            KeyState::Password {
                key,
                salt,
                iterations,
            } => {
                let salt_b64 = B64.encode(salt);
                let aad = associated_data(&salt_b64, *iterations);
                VaultFile {
                    version: VAULT_VERSION.to_string(),
                    data: seal(key, &plaintext, aad.as_bytes())?,
                    salt: Some(salt_b64),
                    kdf: Some(KdfSection {
                        algorithm: KDF_ALGORITHM.to_string(),
                        iterations: *iterations,
                    }),
                }
            }
            KeyState::Legacy { key } => {
                warn_legacy(&self.path);
                VaultFile {
                    version: LEGACY_VERSION.to_string(),
                    data: key.encrypt(&plaintext)?,
                    salt: None,
                    kdf: None,
                }
            }
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &bytes).await
    }
}

fn warn_legacy(path: &Path) {
    tracing::warn!(
        path = %path.display(),
        "using legacy v1 credential vault: its key is stored unencrypted next to the data; \
         migrate to a master-password vault"
    );
}

fn associated_data(salt_b64: &str, iterations: u32) -> String {
    format!("infra-mcp-vault:{VAULT_VERSION}:{KDF_ALGORITHM}:{iterations}:{salt_b64}")
}

fn new_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// PBKDF2 is deliberately slow, so it runs on the blocking pool.
async fn derive_key(password: &str, salt: [u8; SALT_LEN], iterations: u32) -> Result<[u8; KEY_LEN]> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut key);
        key
    })
    .await
    .map_err(|e| Error::internal(format!("key derivation task failed: {e}")))
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| Error::internal("vault encryption failed"))?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(nonce.as_slice());
    blob.extend_from_slice(&ciphertext);
    Ok(B64.encode(blob))
}

fn unseal_records(
    key: &[u8; KEY_LEN],
    data: &str,
    aad: &[u8],
) -> Result<BTreeMap<String, CredentialRecord>> {
    const REJECTED: &str = "cannot decrypt vault: wrong master password or tampered file";

    let blob = B64
        .decode(data.trim())
        .map_err(|_| Error::authentication(REJECTED))?;
    if blob.len() <= NONCE_LEN {
        return Err(Error::authentication(REJECTED));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::authentication(REJECTED))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| Error::internal(format!("vault contents are not a host map: {e}")))
}

async fn read_file(path: &Path) -> Result<VaultFile> {
    let contents = tokio::fs::read(path).await?;
    serde_json::from_slice(&contents).map_err(|e| {
        Error::configuration(format!("cannot parse vault file {}: {e}", path.display()))
    })
}

/// Write to a temp file beside `path`, then rename over it so readers never
/// see a partial store.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("vault");
    let temp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&temp, bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = tokio::fs::set_permissions(&temp, perms).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}
