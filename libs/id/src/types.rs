//! Uid kinds for every stored object.

use crate::define_uid;

define_uid!(
    /// Identity of a RunPolicy object (one per logical machine).
    MachineUid,
    "vm"
);

define_uid!(
    /// Identity of one Instance; changes every time the Instance is recreated.
    InstanceUid,
    "vmi"
);

define_uid!(
    /// Identity of a MigrationRequest and of the MigrationState it drives.
    MigrationUid,
    "mig"
);

/// Store-wide monotonically increasing object version.
///
/// Every mutation of any object is stamped with a fresh, larger version.
/// Writers that carry a stale version are rejected (optimistic concurrency).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Version of an object that has never been stored.
    pub const UNSET: Self = Self(0);

    /// Creates a version from its raw value.
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResourceVersion {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| crate::IdError::InvalidVersion(e.to_string()))
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_instance_uid_roundtrip() {
        let uid = InstanceUid::new();
        let parsed: InstanceUid = uid.to_string().parse().unwrap();
        assert_eq!(uid, parsed);
        assert!(uid.to_string().starts_with("vmi_"));
    }

    #[test]
    fn test_uid_kinds_do_not_mix() {
        let machine = MachineUid::new().to_string();
        let err = machine.parse::<InstanceUid>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_uid_missing_separator() {
        let err = "vmi01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<InstanceUid>().unwrap_err();
        assert_eq!(err, crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_uid_empty() {
        assert_eq!("".parse::<MigrationUid>().unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_uid_invalid_ulid() {
        let err = "mig_not-a-ulid".parse::<MigrationUid>().unwrap_err();
        assert!(matches!(err, crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_recreated_instance_gets_new_uid() {
        let first = InstanceUid::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = InstanceUid::new();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_uid_json_is_string() {
        let uid = MigrationUid::new();
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, format!("\"{uid}\""));
        let back: MigrationUid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
    }

    #[test]
    fn test_resource_version_ordering() {
        let v = ResourceVersion::UNSET;
        assert!(v.next() > v);
        assert_eq!(v.next().next().value(), 2);
        let json = serde_json::to_string(&ResourceVersion::new(42)).unwrap();
        assert_eq!(json, "\"42\"");
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [MachineUid::PREFIX, InstanceUid::PREFIX, MigrationUid::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_foreign_prefix_rejected(prefix in "[a-z]{1,6}") {
            prop_assume!(prefix != InstanceUid::PREFIX);
            let candidate = format!("{}_{}", prefix, crate::Ulid::new());
            prop_assert!(candidate.parse::<InstanceUid>().is_err());
        }
    }
}
