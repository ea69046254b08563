//! Asset reference rewriting for rendered HTML
//!
//! Rendered pages reference assets relative to the internal rendering origin.
//! Root-relative (`src="/app.js"`) and loopback (`href="http://localhost:4200/x"`)
//! attribute values are pointed at the public origin of the rendered URL.
//! This is a literal pattern rewrite over `href`/`src` values, not a DOM pass.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

/// `href="/path"` or `src="/path"`; protocol-relative `//host/...` is left alone
static ROOT_RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(href|src)="/([^/"][^"]*)?""#).expect("valid root-relative pattern"));

/// `href="http://localhost:<port>/path"` or the `src` equivalent
static LOOPBACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(href|src)="http://localhost:\d+/([^"]*)""#).expect("valid loopback pattern")
});

/// `scheme://host[:port]` of `url`
pub fn base_origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Rewrite root-relative and loopback asset references in `html` to the
/// origin of `target`.
pub fn rewrite_asset_urls(html: &str, target: &Url) -> String {
    let origin = base_origin(target);
    let to_origin = |caps: &Captures| {
        let path = caps.get(2).map_or("", |m| m.as_str());
        format!("{}=\"{}/{}\"", &caps[1], origin, path)
    };

    let html = ROOT_RELATIVE.replace_all(html, &to_origin);
    LOOPBACK.replace_all(&html, &to_origin).into_owned()
}
