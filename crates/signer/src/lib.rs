/*!
nipsigner

Pluggable Nostr signers and the protocols built on top of them:
- `signers`    : the `Signer` capability trait and its local key, NIP-07 host and NIP-46 remote backends
- `encryption` : NIP-04 / NIP-44 scheme selection with fallback for direct messages
- `nip59`      : gift wrap and unwrap (rumor, seal, wrap)
- `relay`      : relay transport and directory traits the remote signer talks through
*/

pub mod config;
pub mod encryption;
pub mod error;
pub mod nip59;
pub mod relay;
pub mod signers;


pub use config::{EncryptionConfig, ExtensionConfig, GiftWrapConfig, RemoteSignerConfig, SignerConfig};
pub use encryption::{EncryptedContent, EventEncryptor};
pub use error::{SignerError, SignerResult};
pub use nip59::GiftWrapOptions;
pub use relay::{DirectoryEntry, DirectoryResolver, RelayTransport};
pub use signers::{
    EncryptionScheme, ExtensionHost, HostError, Nip07Signer, Nip46Signer, PrivateKeySigner, RemoteSignerState,
    SchemeSet, Signer, User,
};
