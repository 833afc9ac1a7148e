//! Remote device records.

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;

/// A remote device as seen by the local adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub alias: SmolStr,
   /// Class of device, when the remote advertised one.
   pub class: Option<u32>,
   pub connected: bool,
}

impl DeviceRecord {
   pub fn new(address: Address) -> Self {
      Self {
         address,
         name: None,
         alias: SmolStr::default(),
         class: None,
         connected: false,
      }
   }

   /// Name to show a user: the remote name, else the alias, else the address.
   pub fn display_name(&self) -> SmolStr {
      match &self.name {
         Some(name) if !name.is_empty() => name.clone(),
         _ if !self.alias.is_empty() => self.alias.clone(),
         _ => self.address.to_string().into(),
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
         "address": self.address.to_string(),
         "name": self.display_name().as_str(),
         "connected": self.connected,
      });
      if let Some(class) = self.class {
         info["class"] = json!(format!("{class:#08x}"));
      }
      info
   }
}

/// Bond (pairing) state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BondState {
   None,
   Bonding,
   Bonded,
}

impl BondState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR: Address = Address([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);

   #[test]
   fn test_display_name_fallbacks() {
      let mut record = DeviceRecord::new(ADDR);
      assert_eq!(record.display_name(), "10:20:30:40:50:60");

      record.alias = SmolStr::new_static("Speaker");
      assert_eq!(record.display_name(), "Speaker");

      record.name = Some(SmolStr::new_static("JBL Flip"));
      assert_eq!(record.display_name(), "JBL Flip");
   }

   #[test]
   fn test_json_includes_class_only_when_known() {
      let mut record = DeviceRecord::new(ADDR);
      assert!(record.to_json().get("class").is_none());

      record.class = Some(0x240404);
      let json = record.to_json();
      assert_eq!(json["class"], "0x240404");
      assert_eq!(json["connected"], false);
   }
}
