// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! Peer service registry
//!
//! Fixed 64-slot table indexed by SAP, owning the per-link view of the
//! registered services and the SAP allocator:
//!
//! - `urn:nfc:sn:sdp` is reserved (the engine serves SDP itself)
//! - `urn:nfc:sn:snep` is pinned to SAP 4
//! - other named services get the lowest free SAP in `0x10..=0x1f`
//! - unnamed services get the lowest free SAP in `0x20..=0x3f`
//!
//! Services are shared by reference count; `copy` builds an independent
//! table over the same services, which is what the engine receives for each
//! link.

use crate::llc::service::PeerService;
use crate::protocol::{
    NAME_SDP, NAME_SNEP, SAP_COUNT, SAP_MAX, SAP_NAMED_FIRST, SAP_SNEP, SAP_UNNAMED_FIRST,
    SAP_WKS_LAST,
};
use crate::{Error, Result};

/// Per-link service table and SAP allocator.
pub struct PeerServices {
    slots: [Option<PeerService>; SAP_COUNT],
}

impl Default for PeerServices {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerServices {
    pub fn new() -> PeerServices {
        PeerServices {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Register a service and assign its SAP. See the module docs for the
    /// allocation rules.
    pub fn add(&mut self, service: &PeerService) -> Result<u8> {
        match service.name() {
            Some(NAME_SDP) => Err(Error::ServiceNameReserved),
            Some(name) => {
                if self.find_by_name(name).is_some() {
                    return Err(Error::DuplicateServiceName);
                }
                if name == NAME_SNEP {
                    self.place(SAP_SNEP, service)
                } else {
                    self.alloc(SAP_NAMED_FIRST, SAP_UNNAMED_FIRST - 1, service)
                }
            }
            None => self.alloc(SAP_UNNAMED_FIRST, SAP_MAX, service),
        }
    }

    /// Unregister a service. Dynamically assigned SAPs are released;
    /// well-known ones stick to the service for re-registration.
    pub fn remove(&mut self, service: &PeerService) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.same(service)) {
                *slot = None;
                if service.sap() > SAP_WKS_LAST {
                    service.shared.sap.set(0);
                }
                return;
            }
        }
    }

    pub fn find_by_sap(&self, sap: u8) -> Option<PeerService> {
        self.slots.get(sap as usize).and_then(Clone::clone)
    }

    pub fn find_by_name(&self, name: &str) -> Option<PeerService> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.name() == Some(name))
            .cloned()
    }

    /// Independent table over the same (reference-counted) services.
    pub fn copy(&self) -> PeerServices {
        PeerServices {
            slots: std::array::from_fn(|i| self.slots[i].clone()),
        }
    }

    /// Tell every registered service that a peer link came up.
    pub fn notify_peer_arrived(&self) {
        for service in self.slots.iter().flatten() {
            service.peer_arrived();
        }
    }

    /// Tell every registered service that the peer link went away.
    pub fn notify_peer_left(&self) {
        for service in self.slots.iter().flatten() {
            service.peer_left();
        }
    }

    fn place(&mut self, sap: u8, service: &PeerService) -> Result<u8> {
        let slot = &mut self.slots[sap as usize];
        if slot.is_some() {
            return Err(Error::SapInUse);
        }
        service.shared.sap.set(sap);
        *slot = Some(service.clone());
        log::debug!("Registered service {:?} at SAP {}", service.name(), sap);
        Ok(sap)
    }

    fn alloc(&mut self, first: u8, last: u8, service: &PeerService) -> Result<u8> {
        for sap in first..=last {
            if self.slots[sap as usize].is_none() {
                return self.place(sap, service);
            }
        }
        Err(Error::SapExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llc::service::DefaultServiceHandler;

    fn named(name: &str) -> PeerService {
        PeerService::new(Some(name), Box::new(DefaultServiceHandler))
    }

    fn unnamed() -> PeerService {
        PeerService::new(None, Box::new(DefaultServiceHandler))
    }

    #[test]
    fn test_sdp_name_is_reserved() {
        let mut reg = PeerServices::new();
        assert!(matches!(
            reg.add(&named(NAME_SDP)),
            Err(Error::ServiceNameReserved)
        ));
    }

    #[test]
    fn test_snep_name_forces_sap_4() {
        let mut reg = PeerServices::new();
        assert_eq!(reg.add(&named(NAME_SNEP)).unwrap(), SAP_SNEP);
        assert!(reg.find_by_sap(SAP_SNEP).is_some());
    }

    #[test]
    fn test_named_services_fill_0x10_to_0x1f() {
        let mut reg = PeerServices::new();
        let mut saps = Vec::new();
        for i in 0..16 {
            let svc = named(&format!("urn:nfc:sn:svc{i}"));
            saps.push(reg.add(&svc).unwrap());
        }
        assert_eq!(saps.first(), Some(&0x10));
        assert_eq!(saps.last(), Some(&0x1f));
        saps.sort_unstable();
        saps.dedup();
        assert_eq!(saps.len(), 16, "every named service got a distinct SAP");

        // The 17th named registration has nowhere to go
        assert!(matches!(
            reg.add(&named("urn:nfc:sn:overflow")),
            Err(Error::SapExhausted)
        ));
    }

    #[test]
    fn test_unnamed_services_fill_0x20_to_0x3f() {
        let mut reg = PeerServices::new();
        for _ in 0..32 {
            let sap = reg.add(&unnamed()).unwrap();
            assert!((0x20..=0x3f).contains(&sap));
        }
        assert!(matches!(reg.add(&unnamed()), Err(Error::SapExhausted)));
    }

    #[test]
    fn test_duplicate_name_fails() {
        let mut reg = PeerServices::new();
        reg.add(&named("urn:nfc:sn:dup")).unwrap();
        assert!(matches!(
            reg.add(&named("urn:nfc:sn:dup")),
            Err(Error::DuplicateServiceName)
        ));
    }

    #[test]
    fn test_remove_releases_dynamic_sap() {
        let mut reg = PeerServices::new();
        let svc = named("urn:nfc:sn:tmp");
        let sap = reg.add(&svc).unwrap();
        reg.remove(&svc);
        assert_eq!(svc.sap(), 0, "dynamic SAP released");
        assert!(reg.find_by_sap(sap).is_none());

        let snep = named(NAME_SNEP);
        reg.add(&snep).unwrap();
        reg.remove(&snep);
        assert_eq!(snep.sap(), SAP_SNEP, "well-known SAP sticks");
    }

    #[test]
    fn test_copy_shares_services() {
        let mut reg = PeerServices::new();
        let svc = named("urn:nfc:sn:shared");
        reg.add(&svc).unwrap();

        let mut view = reg.copy();
        assert!(view.find_by_name("urn:nfc:sn:shared").is_some());

        // Mutating the copy leaves the original alone
        view.remove(&svc);
        assert!(reg.find_by_name("urn:nfc:sn:shared").is_some());
    }

    #[test]
    fn test_find_by_name_and_sap_agree() {
        let mut reg = PeerServices::new();
        let svc = named("urn:nfc:sn:find");
        let sap = reg.add(&svc).unwrap();
        let by_name = reg.find_by_name("urn:nfc:sn:find").unwrap();
        let by_sap = reg.find_by_sap(sap).unwrap();
        assert!(by_name.same(&by_sap));
    }
}
