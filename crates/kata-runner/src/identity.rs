use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Field, ValidationError};

pub const KATA_ID_LEN: usize = 10;
pub const UID_BASE: u32 = 40_000;
pub const GID: u32 = 5_000;
pub const GROUP: &str = "cyber-dojo";

/// Order is significant: an avatar's uid is derived from its position.
pub const AVATAR_NAMES: [&str; 64] = [
    "alligator", "antelope", "bat", "bear", "bee", "beetle", "buffalo", "butterfly",
    "cheetah", "crab", "deer", "dolphin", "eagle", "elephant", "flamingo", "fox",
    "frog", "gopher", "gorilla", "heron", "hippo", "hummingbird", "hyena", "jellyfish",
    "kangaroo", "kingfisher", "koala", "leopard", "lion", "lizard", "lobster", "moose",
    "mouse", "ostrich", "owl", "panda", "parrot", "peacock", "penguin", "porcupine",
    "puffin", "rabbit", "raccoon", "ray", "rhino", "salmon", "seal", "shark",
    "skunk", "snake", "spider", "squid", "squirrel", "starfish", "swan", "tiger",
    "toucan", "tuna", "turtle", "vulture", "walrus", "whale", "wolf", "zebra",
];

/// Ten upper-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KataId(String);

impl KataId {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if valid_kata_id(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(ValidationError::invalid(Field::KataId))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn valid_kata_id(s: &str) -> bool {
    s.len() == KATA_ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'))
}

/// Ordered, duplicate-free set of avatar names. Membership decides validity and
/// position decides the uid.
#[derive(Debug, Clone)]
pub struct AvatarCatalog {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl AvatarCatalog {
    pub fn new<I, S>(names: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = AvatarCatalog {
            names: Vec::new(),
            index: HashMap::new(),
        };
        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err("avatar catalog contains an empty name".to_string());
            }
            if out.index.insert(name.clone(), out.names.len()).is_some() {
                return Err(format!("avatar catalog contains {name:?} twice"));
            }
            out.names.push(name);
        }
        Ok(out)
    }

    pub fn standard() -> &'static AvatarCatalog {
        static CATALOG: OnceLock<AvatarCatalog> = OnceLock::new();
        CATALOG.get_or_init(|| AvatarCatalog {
            names: AVATAR_NAMES.iter().map(|n| n.to_string()).collect(),
            index: AVATAR_NAMES
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), i))
                .collect(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn parse(&self, name: &str) -> Result<AvatarName, ValidationError> {
        match self.index_of(name) {
            Some(index) => Ok(AvatarName {
                name: name.to_string(),
                index,
            }),
            None => Err(ValidationError::invalid(Field::AvatarName)),
        }
    }
}

/// A catalog member. Only obtainable through [`AvatarCatalog::parse`], so the
/// uid is always defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AvatarName {
    name: String,
    index: usize,
}

impl AvatarName {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        UID_BASE + self.index as u32
    }
}

impl fmt::Display for AvatarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// uid of a name in the standard catalog.
pub fn user_id(name: &str) -> Result<u32, ValidationError> {
    AvatarCatalog::standard().parse(name).map(|a| a.uid())
}

/// Baked into the image; not inside the kata volume.
pub fn home_path(name: &str) -> String {
    format!("/home/{name}")
}

pub fn sandbox_path(sandboxes_root: &str, name: &str) -> String {
    format!("{sandboxes_root}/{name}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName(String);

impl ImageName {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if valid_image_name(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(ValidationError::invalid(Field::ImageName))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The image name without its tag or digest, as listed by `docker images`.
    pub fn repository(&self) -> &str {
        let s = self.0.split('@').next().unwrap_or(&self.0);
        let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[last_slash..].find(':') {
            Some(colon) => &s[..last_slash + colon],
            None => s,
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn image_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
        let domain = format!(r"{domain_component}(?:\.{domain_component})*(?::[0-9]+)?");
        let name_component = r"[a-z0-9]+(?:(?:[._]|__|-*)[a-z0-9]+)*";
        let name = format!(r"(?:{domain}/)?{name_component}(?:/{name_component})*");
        let tag = r"[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}";
        let digest = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";
        let full = format!(r"^{name}(?::{tag})?(?:@{digest})?$");
        Regex::new(&full).ok()
    })
    .as_ref()
}

/// `[host[:port]/]component(/component)*[:tag][@digest]`.
pub fn valid_image_name(s: &str) -> bool {
    !s.is_empty() && s.len() <= 255 && image_name_regex().is_some_and(|re| re.is_match(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_unique_and_ordered() {
        let catalog = AvatarCatalog::standard();
        assert_eq!(catalog.len(), 64);
        assert_eq!(catalog.index_of("alligator"), Some(0));
        assert_eq!(catalog.index_of("zebra"), Some(63));
        assert!(!catalog.contains("Salmon"));
    }

    #[test]
    fn custom_catalog_rejects_duplicates() {
        assert!(AvatarCatalog::new(["lion", "tiger", "lion"]).is_err());
        assert!(AvatarCatalog::new(["lion", ""]).is_err());
        let c = AvatarCatalog::new(["lion", "tiger"]).unwrap();
        assert_eq!(c.parse("tiger").unwrap().uid(), UID_BASE + 1);
    }

    #[test]
    fn repository_strips_tag_and_digest() {
        let i = ImageName::parse("localhost:5000/cyberdojo/gcc_assert:1.2").unwrap();
        assert_eq!(i.repository(), "localhost:5000/cyberdojo/gcc_assert");
        let i = ImageName::parse("cyberdojofoundation/gcc_assert").unwrap();
        assert_eq!(i.repository(), "cyberdojofoundation/gcc_assert");
        let digest = format!("alpine@sha256:{}", "a".repeat(64));
        assert_eq!(ImageName::parse(&digest).unwrap().repository(), "alpine");
    }

    #[test]
    fn home_and_sandbox_paths() {
        assert_eq!(home_path("salmon"), "/home/salmon");
        assert_eq!(sandbox_path("/sandboxes", "salmon"), "/sandboxes/salmon");
    }
}
