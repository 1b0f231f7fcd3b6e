use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use nipsigner_core::PublicKey;

use crate::error::{SignerError, SignerResult};

const BUNKER_PREFIX: &str = "bunker://";

/// Where the remote agent lives, as given by the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionToken {
    /// Pubkey known up front: bare hex, `npub1...`, `<pubkey>#<secret>` or a
    /// `bunker://` URL.
    Pubkey {
        pubkey: PublicKey,
        secret: Option<String>,
        relays: Vec<String>,
    },
    /// `name@domain` or a bare domain, resolved through the directory.
    Identifier { identifier: String, secret: Option<String> },
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENTIFIER: OnceLock<Option<Regex>> = OnceLock::new();
    IDENTIFIER
        .get_or_init(|| Regex::new(r"^(?:[A-Za-z0-9._+\-]+@)?[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)+$").ok())
        .as_ref()
}

impl ConnectionToken {
    pub fn parse(token: &str) -> SignerResult<Self> {
        let token = token.trim();
        if token.starts_with(BUNKER_PREFIX) {
            return parse_bunker_url(token);
        }

        let (head, secret) = match token.split_once('#') {
            Some((head, secret)) if !secret.is_empty() => (head, Some(secret.to_string())),
            Some((head, _)) => (head, None),
            None => (token, None),
        };

        if head.starts_with("npub1") || (head.len() == 64 && head.chars().all(|c| c.is_ascii_hexdigit())) {
            let pubkey = PublicKey::parse(head).map_err(|e| SignerError::InvalidConnectionToken(e.to_string()))?;
            return Ok(ConnectionToken::Pubkey {
                pubkey,
                secret,
                relays: Vec::new(),
            });
        }

        if identifier_regex().is_some_and(|re| re.is_match(head)) {
            return Ok(ConnectionToken::Identifier {
                identifier: head.to_string(),
                secret,
            });
        }

        Err(SignerError::InvalidConnectionToken(token.to_string()))
    }

    pub fn secret(&self) -> Option<&str> {
        match self {
            ConnectionToken::Pubkey { secret, .. } | ConnectionToken::Identifier { secret, .. } => secret.as_deref(),
        }
    }

    pub fn needs_resolution(&self) -> bool {
        matches!(self, ConnectionToken::Identifier { .. })
    }
}

/// `bunker://<hex pubkey>?relay=wss://...&relay=...&secret=...`
fn parse_bunker_url(token: &str) -> SignerResult<ConnectionToken> {
    let invalid = |msg: &str| SignerError::InvalidConnectionToken(format!("{}: {}", msg, token));

    let rest = &token[BUNKER_PREFIX.len()..];
    let (remote_pubkey, query) = rest.split_once('?').unwrap_or((rest, ""));

    if remote_pubkey.len() != 64 || !remote_pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("Invalid remote signer pubkey in bunker URL"));
    }
    let pubkey = PublicKey::from_hex(remote_pubkey).map_err(|_| invalid("Invalid remote signer pubkey"))?;

    let params = Url::parse(&format!("http://localhost/?{}", query)).map_err(|_| invalid("Invalid URL parameters"))?;

    let relays: Vec<String> = params
        .query_pairs()
        .filter_map(|(k, v)| if k == "relay" { Some(v.to_string()) } else { None })
        .collect();
    if relays.is_empty() {
        return Err(invalid("No relays specified in bunker URL"));
    }

    let secret = params
        .query_pairs()
        .find_map(|(k, v)| if k == "secret" && !v.is_empty() { Some(v.to_string()) } else { None });

    Ok(ConnectionToken::Pubkey { pubkey, secret, relays })
}

/// Render a `bunker://` URL that reconnects to the same agent.
pub fn bunker_url(pubkey: &PublicKey, relays: &[String], secret: Option<&str>) -> String {
    let mut url = format!("{}{}", BUNKER_PREFIX, pubkey.to_hex());
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for relay in relays {
        query.append_pair("relay", relay);
    }
    if let Some(secret) = secret {
        query.append_pair("secret", secret);
    }
    let query = query.finish();
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}
