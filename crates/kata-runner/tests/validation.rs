use std::collections::HashSet;

use kata_runner::identity::{
    user_id, valid_image_name, valid_kata_id, AvatarCatalog, KataId, AVATAR_NAMES, UID_BASE,
};
use kata_runner::{Field, ValidationError};

const HEX: &[u8] = b"0123456789ABCDEF";

#[test]
fn every_ten_digit_upper_hex_id_is_valid() {
    // A cheap deterministic walk over the alphabet at every position.
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for _ in 0..2_000 {
        let id: String = (0..10)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                HEX[(state % 16) as usize] as char
            })
            .collect();
        assert!(valid_kata_id(&id), "{id}");
        assert_eq!(KataId::parse(&id).expect("valid").as_str(), id);
    }
}

#[test]
fn malformed_kata_ids_are_rejected() {
    for bad in [
        "",
        "A1B2C3D4E",
        "A1B2C3D4E5F",
        "a1b2c3d4e5",
        "A1B2C3D4EG",
        "A1B2C3 4E5",
        "A1B2C3D4E\u{e9}",
    ] {
        assert!(!valid_kata_id(bad), "{bad:?}");
        assert_eq!(
            KataId::parse(bad).expect_err("invalid"),
            ValidationError::invalid(Field::KataId)
        );
    }
}

#[test]
fn user_ids_are_unique_stable_and_positional() {
    let mut seen = HashSet::new();
    for (index, name) in AVATAR_NAMES.iter().enumerate() {
        let uid = user_id(name).expect("catalog member");
        assert_eq!(uid, UID_BASE + index as u32);
        assert_eq!(user_id(name).expect("catalog member"), uid);
        assert!(seen.insert(uid), "{name} shares uid {uid}");
    }
    assert_eq!(seen.len(), AvatarCatalog::standard().len());
}

#[test]
fn names_outside_the_catalog_have_no_uid() {
    for bad in ["", "Salmon", "unicorn", "salmon "] {
        assert_eq!(
            user_id(bad).expect_err("not a member"),
            ValidationError::invalid(Field::AvatarName)
        );
    }
}

#[test]
fn image_names_follow_the_reference_grammar() {
    for ok in [
        "alpine",
        "alpine:3.6",
        "cyberdojofoundation/gcc_assert",
        "cyberdojofoundation/gcc_assert:latest",
        "localhost:5000/team/image_name:v1.2",
        "quay.io/org/sub-name/image",
    ] {
        assert!(valid_image_name(ok), "{ok}");
    }
    for bad in [
        "",
        "Alpine",
        "alpine:",
        ":latest",
        "a//b",
        "alpine/",
        "has space",
        "-leading",
        "trailing-",
    ] {
        assert!(!valid_image_name(bad), "{bad:?}");
    }
}
