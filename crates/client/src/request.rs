//! Outgoing request model seen at the network edge.

use std::fmt;
use std::str::FromStr;

use posa_core::Error;
use url::Url;

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Document,
    Script,
    Style,
    Worker,
    Font,
    Image,
    Manifest,
    /// `fetch()`/XHR and anything else without a resource kind.
    Empty,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Destination::Document => "document",
            Destination::Script => "script",
            Destination::Style => "style",
            Destination::Worker => "worker",
            Destination::Font => "font",
            Destination::Image => "image",
            Destination::Manifest => "manifest",
            Destination::Empty => "empty",
        }
    }

    /// Static resource kinds served network-first with a cache fallback.
    pub fn is_asset(self) -> bool {
        matches!(
            self,
            Destination::Script | Destination::Style | Destination::Worker | Destination::Font | Destination::Image
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" => Ok(Destination::Document),
            "script" => Ok(Destination::Script),
            "style" => Ok(Destination::Style),
            "worker" => Ok(Destination::Worker),
            "font" => Ok(Destination::Font),
            "image" => Ok(Destination::Image),
            "manifest" => Ok(Destination::Manifest),
            "" | "empty" => Ok(Destination::Empty),
            other => Err(Error::InvalidInput(format!("unknown request destination '{other}'"))),
        }
    }
}

/// Request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    SameOrigin,
    NoCors,
    Cors,
}

/// HTTP cache behaviour requested for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Always go to the origin and do not store the result.
    NoStore,
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub destination: Destination,
    pub mode: RequestMode,
    pub cache: CacheMode,
}

impl Request {
    /// A plain `GET` as issued by `fetch()`.
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            destination: Destination::Empty,
            mode: RequestMode::Cors,
            cache: CacheMode::Default,
        }
    }

    /// A top-level page navigation.
    pub fn navigate(url: Url) -> Self {
        Self { destination: Destination::Document, mode: RequestMode::Navigate, ..Self::get(url) }
    }

    /// A subresource load of kind `destination`.
    pub fn resource(url: Url, destination: Destination) -> Self {
        Self { destination, mode: RequestMode::NoCors, ..Self::get(url) }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_constructors() {
        let nav = Request::navigate(url("https://pos.local/app/posapp"));
        assert!(nav.is_navigation());
        assert_eq!(nav.destination, Destination::Document);

        let script = Request::resource(url("https://pos.local/a.js"), Destination::Script);
        assert!(!script.is_navigation());
        assert!(script.destination.is_asset());

        let post = Request::get(url("https://pos.local/api")).with_method("post");
        assert!(!post.is_get());
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!("Script".parse::<Destination>().unwrap(), Destination::Script);
        assert_eq!("".parse::<Destination>().unwrap(), Destination::Empty);
        assert!("video".parse::<Destination>().is_err());
        assert!(!Destination::Manifest.is_asset());
    }
}
