//! Newtype wrappers for record identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Stable hardware identifier of a machine (MAC address or equivalent).
    MachineId
);

string_newtype!(
    /// Image name; unique within the catalog and used as the image's key.
    ImageId
);

string_newtype!(
    /// Surrogate identifier of a boot session.
    SessionId
);

string_newtype!(
    /// Surrogate identifier of a conversion job.
    JobId
);

string_newtype!(
    /// Storage target name, derived from a (machine, image) pair.
    TargetName
);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Hex digits of the pair digest carried in a target name.
const PAIR_DIGEST_LEN: usize = 12;

impl TargetName {
    /// Deterministic target name for a machine/image pair.
    ///
    /// The readable part is lowercased with `:` rewritten to `-`, matching
    /// what an iSCSI IQN suffix can carry. That rewrite is lossy and `-` is
    /// legal in both identifiers, so the name ends with a digest of the
    /// exact pair to keep distinct pairs on distinct names.
    pub fn for_pair(machine: &MachineId, image: &ImageId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(machine.as_bytes());
        hasher.update(&[0]);
        hasher.update(image.as_bytes());
        let digest = hasher.finalize().to_hex();
        Self(format!(
            "{}-{}-{}",
            machine.replace(':', "-").to_ascii_lowercase(),
            image.to_ascii_lowercase(),
            &digest[..PAIR_DIGEST_LEN]
        ))
    }
}

pub fn validate_machine_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.len() > 64 {
        return Err(StoreError::InvalidName(
            "machine identifier must be 1-64 characters".to_owned(),
        ));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'.' | b'_' | b'-'))
    {
        return Err(StoreError::InvalidName(
            "machine identifier must match [a-zA-Z0-9:._-]".to_owned(),
        ));
    }
    Ok(())
}

pub fn validate_image_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 64 {
        return Err(StoreError::InvalidName(
            "image name must be 1-64 characters".to_owned(),
        ));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(StoreError::InvalidName(
            "image name must not start with '.' or '-'".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(StoreError::InvalidName(
            "image name must match [a-zA-Z0-9._-]".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_display_and_as_ref() {
        let id = MachineId::new("aa:bb:cc:dd:ee:ff");
        assert_eq!(id.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(AsRef::<str>::as_ref(&id), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let id = SessionId::new("s-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s-1\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn target_name_is_deterministic() {
        let m = MachineId::new("M1");
        let i = ImageId::new("win11-base");
        let name = TargetName::for_pair(&m, &i);
        assert!(name.starts_with("m1-win11-base-"), "{name}");
        assert_eq!(name.len(), "m1-win11-base-".len() + PAIR_DIGEST_LEN);
        assert_eq!(name, TargetName::for_pair(&m, &i));
    }

    #[test]
    fn target_name_rewrites_mac_separators() {
        let m = MachineId::new("AA:BB:cc:00:11:22");
        let i = ImageId::new("Ubuntu");
        let name = TargetName::for_pair(&m, &i);
        assert!(name.starts_with("aa-bb-cc-00-11-22-ubuntu-"), "{name}");
        assert_eq!(name.as_str(), name.to_ascii_lowercase());
    }

    #[test]
    fn ambiguous_pairs_get_distinct_target_names() {
        let pairs = [
            ("M1", "win11-base"),
            ("M1-win11", "base"),
            ("m1", "win11-base"),
            ("aa:bb", "img"),
            ("aa-bb", "img"),
        ];
        let names: std::collections::HashSet<TargetName> = pairs
            .iter()
            .map(|(m, i)| TargetName::for_pair(&MachineId::new(*m), &ImageId::new(*i)))
            .collect();
        assert_eq!(names.len(), pairs.len());
    }

    #[test]
    fn machine_id_validation() {
        assert!(validate_machine_id("aa:bb:cc:dd:ee:ff").is_ok());
        assert!(validate_machine_id("M1").is_ok());
        assert!(validate_machine_id("").is_err());
        assert!(validate_machine_id("has space").is_err());
        assert!(validate_machine_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn image_name_validation() {
        assert!(validate_image_name("win11-base").is_ok());
        assert!(validate_image_name("ubuntu_24.04").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("../etc").is_err());
        assert!(validate_image_name("-rf").is_err());
        assert!(validate_image_name("a/b").is_err());
    }
}
