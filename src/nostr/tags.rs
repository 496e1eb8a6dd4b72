//! Tag builders for Nostr events.
//!
//! This module provides utilities for constructing Nostr event tags
//! following the relevant NIPs:
//! - `e` tag: event reference (NIP-01, NIP-10 markers)
//! - `p` tag: pubkey reference (NIP-01, NIP-02)
//! - `r` tag: relay list entry (NIP-65)
//! - `t` tag: hashtag

/// Builder for Nostr event tags.
///
/// Provides static methods for constructing properly formatted tags.
///
/// # Example
///
/// ```
/// use gnostr_core::nostr::TagBuilder;
///
/// let p_tag = TagBuilder::p_tag("abc123");
/// assert_eq!(p_tag, vec!["p", "abc123"]);
///
/// let r_tag = TagBuilder::r_tag("wss://relay.example.com", None);
/// assert_eq!(r_tag, vec!["r", "wss://relay.example.com"]);
/// ```
pub struct TagBuilder;

impl TagBuilder {
    /// Builds an `e` tag referencing another event.
    ///
    /// The relay hint and NIP-10 marker are optional. A marker without a
    /// hint gets an empty hint so the marker stays in position 3.
    ///
    /// # Example
    ///
    /// ```
    /// use gnostr_core::nostr::TagBuilder;
    ///
    /// assert_eq!(TagBuilder::e_tag("abcd", None, None), vec!["e", "abcd"]);
    /// assert_eq!(
    ///     TagBuilder::e_tag("abcd", None, Some("root")),
    ///     vec!["e", "abcd", "", "root"]
    /// );
    /// ```
    #[must_use]
    pub fn e_tag(event_id: &str, relay_hint: Option<&str>, marker: Option<&str>) -> Vec<String> {
        let mut tag = vec!["e".to_string(), event_id.to_string()];
        match (relay_hint, marker) {
            (hint, Some(marker)) => {
                tag.push(hint.unwrap_or_default().to_string());
                tag.push(marker.to_string());
            }
            (Some(hint), None) => tag.push(hint.to_string()),
            (None, None) => {}
        }
        tag
    }

    /// Builds a `p` tag referencing a public key.
    ///
    /// # Example
    ///
    /// ```
    /// use gnostr_core::nostr::TagBuilder;
    ///
    /// let tag = TagBuilder::p_tag("deadbeef");
    /// assert_eq!(tag, vec!["p", "deadbeef"]);
    /// ```
    #[must_use]
    pub fn p_tag(pubkey_hex: &str) -> Vec<String> {
        vec!["p".to_string(), pubkey_hex.to_string()]
    }

    /// Builds an `r` tag for a NIP-65 relay list.
    ///
    /// `usage` is `"read"` or `"write"`; `None` means both.
    ///
    /// # Example
    ///
    /// ```
    /// use gnostr_core::nostr::TagBuilder;
    ///
    /// let tag = TagBuilder::r_tag("wss://nos.lol", Some("read"));
    /// assert_eq!(tag, vec!["r", "wss://nos.lol", "read"]);
    /// ```
    #[must_use]
    pub fn r_tag(relay_url: &str, usage: Option<&str>) -> Vec<String> {
        let mut tag = vec!["r".to_string(), relay_url.to_string()];
        if let Some(usage) = usage {
            tag.push(usage.to_string());
        }
        tag
    }

    /// Builds a `t` hashtag tag. The value is lowercased.
    ///
    /// # Example
    ///
    /// ```
    /// use gnostr_core::nostr::TagBuilder;
    ///
    /// assert_eq!(TagBuilder::t_tag("Nostr"), vec!["t", "nostr"]);
    /// ```
    #[must_use]
    pub fn t_tag(hashtag: &str) -> Vec<String> {
        vec!["t".to_string(), hashtag.to_lowercase()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e_tag_with_hint_only() {
        let tag = TagBuilder::e_tag("id", Some("wss://r"), None);
        assert_eq!(tag, vec!["e", "id", "wss://r"]);
    }

    #[test]
    fn e_tag_with_hint_and_marker() {
        let tag = TagBuilder::e_tag("id", Some("wss://r"), Some("reply"));
        assert_eq!(tag, vec!["e", "id", "wss://r", "reply"]);
    }

    #[test]
    fn r_tag_without_usage_has_two_elements() {
        assert_eq!(TagBuilder::r_tag("wss://a", None).len(), 2);
    }

    #[test]
    fn t_tag_lowercases() {
        assert_eq!(TagBuilder::t_tag("RustLang")[1], "rustlang");
    }
}
