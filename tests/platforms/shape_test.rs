//! Credential shape rules and the platform registry.

use std::collections::BTreeMap;

use simstim::platforms::{self, PlatformError, PlatformId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn full_cookie_set(id: PlatformId) -> BTreeMap<String, String> {
    platforms::descriptor(id)
        .required_cookies
        .iter()
        .map(|name| ((*name).to_owned(), "value".to_owned()))
        .collect()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn every_platform_name_round_trips_through_from_str() {
    for id in PlatformId::ALL {
        let parsed: PlatformId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
    }
}

#[test]
fn unknown_platform_names_are_rejected_with_the_name() {
    let err = "friendface".parse::<PlatformId>().unwrap_err();
    match err {
        PlatformError::UnknownPlatform(name) => assert_eq!(name, "friendface"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn descriptors_are_internally_consistent() {
    for descriptor in platforms::all_descriptors() {
        assert!(
            !descriptor.required_cookies.is_empty(),
            "{} declares no required cookies",
            descriptor.id
        );
        assert!(
            descriptor.models.contains(&descriptor.default_model),
            "{} default model is not in its model list",
            descriptor.id
        );
        assert!(descriptor.login_url.starts_with("https://"));
        assert!(descriptor.chat_url.starts_with("https://"));
        assert!(descriptor.validation_url.starts_with("https://"));
        assert!(descriptor.default_quota > 0);
    }
}

// ---------------------------------------------------------------------------
// Shape validation
// ---------------------------------------------------------------------------

#[test]
fn complete_required_cookies_pass_for_every_platform() {
    for id in PlatformId::ALL {
        let cookies = full_cookie_set(id);
        assert!(
            platforms::validate_credential_shape(id, &cookies).is_ok(),
            "{id} rejected a complete cookie set"
        );
    }
}

#[test]
fn each_missing_required_cookie_is_named_in_the_rejection() {
    for id in PlatformId::ALL {
        let descriptor = platforms::descriptor(id);
        for dropped in descriptor.required_cookies {
            let mut cookies = full_cookie_set(id);
            cookies.remove(*dropped);
            let err = platforms::validate_credential_shape(id, &cookies).unwrap_err();
            match err {
                PlatformError::ShapeInvalid { platform, missing } => {
                    assert_eq!(platform, id);
                    assert_eq!(missing, vec![(*dropped).to_owned()]);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}

#[test]
fn an_empty_cookie_value_counts_as_missing() {
    let id = PlatformId::Doubao;
    let mut cookies = full_cookie_set(id);
    cookies.insert("sessionid".to_owned(), String::new());
    let err = platforms::validate_credential_shape(id, &cookies).unwrap_err();
    match err {
        PlatformError::ShapeInvalid { missing, .. } => {
            assert_eq!(missing, vec!["sessionid".to_owned()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn extra_cookies_beyond_the_required_set_are_tolerated() {
    let id = PlatformId::Doubao;
    let mut cookies = full_cookie_set(id);
    cookies.insert("tt_webid".to_owned(), "opt".to_owned());
    cookies.insert("unrelated_tracking".to_owned(), "x".to_owned());
    assert!(platforms::validate_credential_shape(id, &cookies).is_ok());
}
