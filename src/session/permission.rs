//! Runtime capabilities required to drive the radio.

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// A capability the permission surface may grant or deny.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Capability {
   Scan,
   Advertise,
   Connect,
   Legacy,
}

/// Set of granted capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionGrant {
   #[serde(default)]
   pub scan: bool,
   #[serde(default)]
   pub advertise: bool,
   #[serde(default)]
   pub connect: bool,
   #[serde(default)]
   pub legacy: bool,
}

impl PermissionGrant {
   pub const ALL: Self = Self {
      scan: true,
      advertise: true,
      connect: true,
      legacy: true,
   };

   pub const NONE: Self = Self {
      scan: false,
      advertise: false,
      connect: false,
      legacy: false,
   };

   pub const fn is_granted(&self, cap: Capability) -> bool {
      match cap {
         Capability::Scan => self.scan,
         Capability::Advertise => self.advertise,
         Capability::Connect => self.connect,
         Capability::Legacy => self.legacy,
      }
   }

   pub const fn with(mut self, cap: Capability, granted: bool) -> Self {
      match cap {
         Capability::Scan => self.scan = granted,
         Capability::Advertise => self.advertise = granted,
         Capability::Connect => self.connect = granted,
         Capability::Legacy => self.legacy = granted,
      }
      self
   }

   pub fn is_complete(&self) -> bool {
      self.first_denied().is_none()
   }

   /// First capability out of `required` that has not been granted.
   pub fn first_missing<I>(&self, required: I) -> Option<Capability>
   where
      I: IntoIterator<Item = Capability>,
   {
      required.into_iter().find(|cap| !self.is_granted(*cap))
   }

   /// First capability of the full set that has not been granted.
   pub fn first_denied(&self) -> Option<Capability> {
      self.first_missing(Capability::iter())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_full_grant() {
      assert!(PermissionGrant::ALL.is_complete());
      assert_eq!(PermissionGrant::ALL.first_denied(), None);
      assert!(!PermissionGrant::NONE.is_complete());
      assert_eq!(PermissionGrant::NONE.first_denied(), Some(Capability::Scan));
   }

   #[test]
   fn test_first_missing_respects_order() {
      let grant = PermissionGrant::ALL
         .with(Capability::Connect, false)
         .with(Capability::Advertise, false);
      assert_eq!(
         grant.first_missing([Capability::Connect, Capability::Advertise]),
         Some(Capability::Connect)
      );
      assert_eq!(grant.first_missing([Capability::Scan]), None);
      assert!(!grant.is_complete());
   }

   #[test]
   fn test_deserialize_partial_table() {
      let grant: PermissionGrant = toml::from_str("scan = true\nconnect = true").unwrap();
      assert!(grant.scan && grant.connect);
      assert!(!grant.advertise && !grant.legacy);
   }
}
