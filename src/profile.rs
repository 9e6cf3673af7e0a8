//! Profile links and the numeric user ids behind them. Screen names can be
//! renamed, so the blacklist keys on the id.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{InputError, UserId};

const PROFILE_URL_PREFIX: &str = "https://vk.com/id";

/// Lower-cased screen name from a profile URL, `@handle` or bare handle.
///
/// Accepts `https://vk.com/name`, `vk.ru/name`, `m.vk.com/name`, `@name`
/// and `name`. Anything after the first `/`, `?` or `&` of a URL is dropped.
pub fn normalize_profile_link(text: &str) -> Result<String, InputError> {
    let raw = text.trim().to_lowercase();
    let bad = || InputError::BadProfileLink(text.trim().to_string());

    let hostless = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .unwrap_or(&raw);
    let hostless = hostless.strip_prefix("m.").unwrap_or(hostless);
    let url_path = hostless
        .strip_prefix("vk.com/")
        .or_else(|| hostless.strip_prefix("vk.ru/"));

    let name = match url_path {
        Some(path) => path.split(['/', '?', '&']).next().unwrap_or_default(),
        None => raw.strip_prefix('@').unwrap_or(&raw),
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(bad());
    }
    Ok(name.to_string())
}

/// Canonical link for a user id. This is the form the blacklist stores.
pub fn profile_url(id: UserId) -> String {
    format!("{PROFILE_URL_PREFIX}{id}")
}

/// `id123` style screen names carry the id themselves.
fn numeric_screen_name(name: &str) -> Option<UserId> {
    let digits = name.strip_prefix("id")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|id| *id > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError(pub String);

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile lookup failed: {}", self.0)
    }
}

impl std::error::Error for ResolveError {}

/// Looks up the user behind a screen name on the chat platform.
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// `Ok(None)` when the name is free or belongs to a group or page.
    async fn resolve(&self, screen_name: &str) -> Result<Option<UserId>, ResolveError>;
}

/// Turn any accepted link form into the user id. `id<N>` names are read
/// directly; anything else goes to `resolver`.
pub async fn resolve_profile(
    resolver: &dyn ProfileResolver,
    link: &str,
) -> Result<Option<UserId>, ResolveError> {
    let Ok(name) = normalize_profile_link(link) else {
        return Ok(None);
    };
    if let Some(id) = numeric_screen_name(&name) {
        return Ok(Some(id));
    }
    resolver.resolve(&name).await
}

/// Fixed name table. Stands in for the platform lookup when no transport is
/// attached.
#[derive(Default)]
pub struct Directory {
    names: DashMap<String, UserId>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, screen_name: &str, id: UserId) {
        self.names.insert(screen_name.trim().to_lowercase(), id);
    }
}

#[async_trait]
impl ProfileResolver for Directory {
    async fn resolve(&self, screen_name: &str) -> Result<Option<UserId>, ResolveError> {
        Ok(self.names.get(screen_name).map(|e| *e.value()))
    }
}
