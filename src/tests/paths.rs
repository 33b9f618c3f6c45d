//! Tests for slug text normalization

use crate::{
    config::SiteConfig,
    paths::{join_slug, normalize_slug, to_alias_segment, with_suffix, SlugFormat},
};
use test_log::test;

#[test]
fn test_normalize_collapses_separators_and_strips_query() {
    let format = SlugFormat::default();
    assert_eq!(
        normalize_slug("//blog//Post One?page=2#top", &format),
        "/blog/post-one"
    );
    assert_eq!(normalize_slug("blog\\post", &format), "/blog/post");
    assert_eq!(normalize_slug("", &format), "/");
    assert_eq!(normalize_slug("///", &format), "/");
}

#[test]
fn test_normalize_replaces_forbidden_characters() {
    let format = SlugFormat::default();
    assert_eq!(normalize_slug("/a.b", &format), "/a-b");
    assert_eq!(normalize_slug("/Fish & Chips", &format), "/fish-chips");
    assert_eq!(normalize_slug("/trailing. ", &format), "/trailing");
    assert_eq!(normalize_slug("/a--b", &format), "/a-b");
}

#[test]
fn test_normalize_decodes_and_strips_accents() {
    let format = SlugFormat::default();
    assert_eq!(normalize_slug("/caf%C3%A9", &format), "/cafe");
    assert_eq!(normalize_slug("/Ärger", &format), "/arger");
}

#[test]
fn test_normalize_escapes_reserved_characters_and_is_stable() {
    let format = SlugFormat::default();
    let once = normalize_slug("/me@home", &format);
    assert_eq!(once, "/me%40home");
    assert_eq!(normalize_slug(&once, &format), once);
}

#[test]
fn test_site_format_overrides() {
    let config = SiteConfig {
        forbidden_chars: "!".to_string(),
        replacement_char: '_',
        lowercase: false,
        ..Default::default()
    };
    let format = SlugFormat::from(&config);
    assert_eq!(normalize_slug("/Hello World!", &format), "/Hello_World");
    assert_eq!(normalize_slug("/keep-dash", &format), "/keep-dash");
}

#[test]
fn test_join_and_suffix() {
    assert_eq!(join_slug("/blog/", "/post"), "/blog/post");
    assert_eq!(join_slug("", "post"), "/post");
    assert_eq!(with_suffix("/blog/post", 2), "/blog/post-2");
    assert_eq!(with_suffix("/blog/post/", 1), "/blog/post-1");
    assert_eq!(with_suffix("/", 1), "/1");
}

#[test]
fn test_alias_segment() {
    assert_eq!(to_alias_segment(" About Us! "), "about-us");
    assert_eq!(to_alias_segment("post-1"), "post-1");
}
