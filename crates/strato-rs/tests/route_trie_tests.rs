//! Routing trie behavior across registration, matching and captures.

use strato_rs::models::context::Response;
use strato_rs::models::route::{handler_fn, Method, Route};
use strato_rs::utils::route_trie::{RouteTrie, RouteTrieError};

fn route(method: Method, pattern: &str) -> Route {
    Route::new(
        method,
        pattern,
        handler_fn(|_req| async move {
            let mut res = Response::new();
            res.send_text("ok")?;
            Ok(res)
        }),
    )
}

fn trie_with(patterns: &[(Method, &str)]) -> RouteTrie {
    let trie = RouteTrie::new();
    for (method, pattern) in patterns {
        trie.register(route(*method, pattern)).unwrap();
    }
    trie
}

#[test]
fn exact_match_set_round_trips() {
    let patterns = [
        (Method::Get, "/"),
        (Method::Get, "/api/users"),
        (Method::Post, "/api/users"),
        (Method::Get, "/api/users/:id"),
        (Method::Get, "/api/users/:id/posts/:post_id"),
        (Method::Get, "/static/*file"),
    ];
    let trie = trie_with(&patterns);
    for (method, pattern) in &patterns {
        let probe = pattern
            .replace(":id", "7")
            .replace(":post_id", "99")
            .replace("*file", "css/site.css");
        let hit = trie
            .matches(*method, &probe)
            .unwrap_or_else(|| panic!("no match for {} {}", method, probe));
        assert_eq!(&hit.route.pattern, pattern);
    }
}

#[test]
fn param_captures_are_exact() {
    let trie = trie_with(&[(Method::Get, "/api/users/:id/posts/:post_id")]);
    let hit = trie.matches(Method::Get, "/api/users/42/posts/1337").unwrap();
    assert_eq!(hit.params.len(), 2);
    assert_eq!(hit.params.get("id").unwrap(), "42");
    assert_eq!(hit.params.get("post_id").unwrap(), "1337");
}

#[test]
fn wildcard_joins_remaining_segments_with_slash() {
    let trie = trie_with(&[(Method::Get, "/files/*rest")]);
    for (path, expected) in [
        ("/files/a", "a"),
        ("/files/a/b/c.txt", "a/b/c.txt"),
        ("/files/deep/tree/x/y/z", "deep/tree/x/y/z"),
    ] {
        let hit = trie.matches(Method::Get, path).unwrap();
        assert_eq!(hit.params.get("rest").unwrap(), expected);
    }
}

#[test]
fn static_beats_param_beats_wildcard() {
    let trie = trie_with(&[
        (Method::Get, "/v/static"),
        (Method::Get, "/v/:param"),
        (Method::Get, "/v/*wild"),
    ]);
    assert_eq!(
        trie.matches(Method::Get, "/v/static").unwrap().route.pattern,
        "/v/static"
    );
    assert_eq!(
        trie.matches(Method::Get, "/v/other").unwrap().route.pattern,
        "/v/:param"
    );
    assert_eq!(
        trie.matches(Method::Get, "/v/a/b").unwrap().route.pattern,
        "/v/*wild"
    );
}

#[test]
fn later_registration_wins() {
    let trie = RouteTrie::new();
    trie.register(route(Method::Get, "/dup").with_timeout_ms(111))
        .unwrap();
    trie.register(route(Method::Get, "/dup").with_timeout_ms(222))
        .unwrap();
    assert_eq!(
        trie.matches(Method::Get, "/dup").unwrap().route.timeout_ms,
        Some(222)
    );
}

#[test]
fn method_isolation() {
    let trie = trie_with(&[(Method::Get, "/only-get")]);
    assert!(trie.matches(Method::Get, "/only-get").is_some());
    assert!(trie.matches(Method::Post, "/only-get").is_none());
    assert!(trie.matches(Method::Delete, "/only-get").is_none());
}

#[test]
fn all_method_matches_everything_and_options_lists_all() {
    let trie = trie_with(&[(Method::All, "/mixed")]);
    for method in Method::concrete() {
        assert!(
            trie.matches(*method, "/mixed").is_some(),
            "ALL should cover {}",
            method
        );
    }
    let allowed = trie.allowed_methods("/mixed");
    assert_eq!(allowed.len(), Method::concrete().len());
}

#[test]
fn empty_path_matches_root_registration() {
    let trie = trie_with(&[(Method::Get, "/")]);
    for probe in ["", "/", "//"] {
        assert!(trie.matches(Method::Get, probe).is_some(), "probe {:?}", probe);
    }
}

#[test]
fn deep_static_tree_lookup() {
    let trie = trie_with(&[
        (Method::Get, "/a/b/c/d/e/f"),
        (Method::Get, "/a/b/c/d/e/g"),
        (Method::Get, "/a/b/x"),
    ]);
    assert!(trie.matches(Method::Get, "/a/b/c/d/e/f").is_some());
    assert!(trie.matches(Method::Get, "/a/b/c/d/e/g").is_some());
    assert!(trie.matches(Method::Get, "/a/b/c/d/e").is_none());
    assert!(trie.matches(Method::Get, "/a/b/x/y").is_none());
}

#[test]
fn wildcard_requires_name_and_terminal_position() {
    let trie = RouteTrie::new();
    assert!(matches!(
        trie.register(route(Method::Get, "/x/*")),
        Err(RouteTrieError::InvalidPattern { .. })
    ));
    assert!(matches!(
        trie.register(route(Method::Get, "/x/*mid/tail")),
        Err(RouteTrieError::InvalidPattern { .. })
    ));
}

#[test]
fn concurrent_reads_share_the_trie() {
    use std::sync::Arc;
    let trie = Arc::new(trie_with(&[
        (Method::Get, "/shared/:id"),
        (Method::Get, "/shared/static"),
    ]));
    let mut handles = Vec::new();
    for i in 0..8 {
        let trie = trie.clone();
        handles.push(std::thread::spawn(move || {
            for n in 0..500 {
                let hit = trie
                    .matches(Method::Get, &format!("/shared/{}", i * 1000 + n))
                    .unwrap();
                assert_eq!(hit.route.pattern, "/shared/:id");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let (lookups, failed) = trie.stats();
    assert_eq!(lookups, 8 * 500);
    assert_eq!(failed, 0);
}
