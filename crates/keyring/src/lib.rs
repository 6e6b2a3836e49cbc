//! Fatbuildr keyring
//!
//! Creates and stores the signing keys of a Fatbuildr instance and signs
//! blobs with them. Private key material and passphrases never leave this
//! crate except through [`KeyringManager::seed_passphrase`].

pub mod backend;
pub mod config;
pub mod gnupg;
pub mod manager;
pub mod passphrase;

pub use backend::{KeyBackend, KeyInfo, KeySpec};
pub use config::{KeyExpiry, KeyScopeMode, KeyringConfig};
pub use gnupg::GnupgBackend;
pub use manager::{KeyHandle, KeyParams, KeyScope, KeyringManager, KeyringSigner, Signature, Signer};
pub use passphrase::{CommandSeeder, NoopSeeder, Passphrase, PassphraseSeeder};
