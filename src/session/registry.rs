//! Known-device registry.
//!
//! Bonded devices come first, in the order the radio reported them; devices
//! found by the last discovery scan form a contiguous trailing segment. A new
//! scan replaces exactly that segment.

use std::collections::HashSet;

use bluer::Address;

use crate::device::Device;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
   bonded: Vec<Device>,
   discovered: Vec<Device>,
}

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// All devices, bonded segment first.
   pub fn iter(&self) -> impl Iterator<Item = &Device> + '_ {
      self.bonded.iter().chain(&self.discovered)
   }

   pub fn devices(&self) -> Vec<Device> {
      self.iter().cloned().collect()
   }

   pub fn bonded(&self) -> &[Device] {
      &self.bonded
   }

   pub fn discovered(&self) -> &[Device] {
      &self.discovered
   }

   pub fn len(&self) -> usize {
      self.bonded.len() + self.discovered.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   pub fn get(&self, address: Address) -> Option<&Device> {
      self.iter().find(|d| d.address == address)
   }

   /// Replaces the bonded segment.
   ///
   /// Discovered entries that are now bonded are dropped from the trailing
   /// segment.
   pub fn replace_bonded(&mut self, bonded: impl IntoIterator<Item = Device>) {
      let mut seen = HashSet::new();
      self.bonded = bonded
         .into_iter()
         .filter(|d| seen.insert(d.address))
         .map(|d| d.bonded(true))
         .collect();
      self.discovered.retain(|d| !seen.contains(&d.address));
   }

   /// Replaces the discovered segment with a scan batch, in reported order.
   ///
   /// Entries already bonded, and repeated addresses, are skipped.
   pub fn merge_discovered(&mut self, found: impl IntoIterator<Item = Device>) {
      let mut seen: HashSet<Address> = self.bonded.iter().map(|d| d.address).collect();
      self.discovered = found
         .into_iter()
         .filter(|d| seen.insert(d.address))
         .map(|d| d.bonded(false))
         .collect();
   }

   /// Replaces the entry with the same address, else appends to the segment
   /// matching `device.bonded`.
   pub fn upsert(&mut self, device: Device) {
      let in_bonded = self.bonded.iter().position(|d| d.address == device.address);
      let in_discovered = self
         .discovered
         .iter()
         .position(|d| d.address == device.address);

      match (device.bonded, in_bonded, in_discovered) {
         (true, Some(idx), _) => self.bonded[idx] = device,
         (false, _, Some(idx)) => self.discovered[idx] = device,
         (true, None, moved) => {
            if let Some(idx) = moved {
               self.discovered.remove(idx);
            }
            self.bonded.push(device);
         },
         (false, moved, None) => {
            if let Some(idx) = moved {
               self.bonded.remove(idx);
            }
            self.discovered.push(device);
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn dev(last: u8, bonded: bool) -> Device {
      Device::new(Address([0x10, 0, 0, 0, 0, last]), format!("dev-{last}")).bonded(bonded)
   }

   fn addrs(reg: &DeviceRegistry) -> Vec<u8> {
      reg.iter().map(|d| d.address.0[5]).collect()
   }

   fn assert_invariants(reg: &DeviceRegistry) {
      let mut seen = HashSet::new();
      assert!(reg.iter().all(|d| seen.insert(d.address)), "duplicate address");
      let first_discovered = reg.iter().position(|d| !d.bonded).unwrap_or(reg.len());
      assert!(
         reg.iter().skip(first_discovered).all(|d| !d.bonded),
         "discovered segment not contiguous"
      );
   }

   #[test]
   fn test_discovery_batches_replace_trailing_segment() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded([dev(1, true), dev(2, true)]);

      reg.merge_discovered([dev(3, false), dev(4, false)]);
      assert_eq!(addrs(&reg), [1, 2, 3, 4]);

      reg.merge_discovered([dev(5, false)]);
      assert_eq!(addrs(&reg), [1, 2, 5]);
      assert_invariants(&reg);
   }

   #[test]
   fn test_merge_skips_bonded_and_duplicate_addresses() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded([dev(1, true)]);
      reg.merge_discovered([dev(3, false), dev(1, false), dev(3, false), dev(4, true)]);

      assert_eq!(addrs(&reg), [1, 3, 4]);
      assert!(reg.get(Address([0x10, 0, 0, 0, 0, 1])).unwrap().bonded);
      assert!(!reg.get(Address([0x10, 0, 0, 0, 0, 4])).unwrap().bonded);
   }

   #[test]
   fn test_replace_bonded_keeps_discovered_segment() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded([dev(1, true)]);
      reg.merge_discovered([dev(3, false), dev(4, false)]);

      // 3 got paired in the meantime
      reg.replace_bonded([dev(2, true), dev(3, true), dev(2, true)]);
      assert_eq!(addrs(&reg), [2, 3, 4]);
      assert_eq!(reg.bonded().len(), 2);
      assert_eq!(reg.discovered().len(), 1);
      assert_invariants(&reg);
   }

   #[test]
   fn test_upsert_replaces_in_place() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded([dev(1, true), dev(2, true)]);
      reg.merge_discovered([dev(3, false)]);

      reg.upsert(dev(1, true).connected(true));
      assert_eq!(addrs(&reg), [1, 2, 3]);
      assert!(reg.bonded()[0].connected);

      reg.upsert(dev(9, false));
      assert_eq!(addrs(&reg), [1, 2, 3, 9]);
   }

   #[test]
   fn test_upsert_moves_between_segments() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded([dev(1, true)]);
      reg.merge_discovered([dev(3, false), dev(4, false)]);

      reg.upsert(dev(4, true));
      assert_eq!(addrs(&reg), [1, 4, 3]);

      reg.upsert(dev(1, false));
      assert_eq!(addrs(&reg), [4, 3, 1]);

      reg.upsert(dev(7, true));
      assert_eq!(addrs(&reg), [4, 7, 3, 1]);
      assert_invariants(&reg);
   }

   proptest::proptest! {
      #[test]
      fn test_merge_sequences_preserve_bonded_order(
         batches in proptest::collection::vec(proptest::collection::vec(0u8..16, 0..8), 0..32)
      ) {
         let mut reg = DeviceRegistry::new();
         reg.replace_bonded([dev(5, true), dev(1, true), dev(9, true)]);
         let bonded_before: Vec<_> = reg.bonded().to_vec();

         for batch in batches {
            let expected: Vec<u8> = {
               let mut seen = HashSet::new();
               batch
                  .iter()
                  .copied()
                  .filter(|n| ![5, 1, 9].contains(n) && seen.insert(*n))
                  .collect()
            };
            reg.merge_discovered(batch.into_iter().map(|n| dev(n, false)));

            proptest::prop_assert_eq!(reg.bonded(), bonded_before.as_slice());
            let discovered: Vec<u8> = reg.discovered().iter().map(|d| d.address.0[5]).collect();
            proptest::prop_assert_eq!(discovered, expected);
            assert_invariants(&reg);
         }
      }
   }
}
