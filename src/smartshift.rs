//! SmartShift backend client (HID++ feature 0x2110)
//!
//! SmartShift is the ratchet/free-spin scroll wheel mode on MX mice: the
//! wheel free-spins until scroll speed drops below an auto-disengage
//! threshold, then re-engages the ratchet. The device exposes one status
//! triple (wheel mode, threshold, default threshold); this module carries
//! that triple as a tri-state value where each field is either explicitly
//! set or left alone, plus the wire encode/decode for the two feature
//! functions.
//!
//! SPDX-License-Identifier: GPL-3.0

use crate::hidpp::{features, HidppError, SharedHidppDevice};

/// Feature functions
const FN_GET_STATUS: u8 = 0x00;
const FN_SET_STATUS: u8 = 0x01;

/// Wire wheel modes. 0 on the wire means "leave the mode unchanged".
const WHEEL_MODE_FREESPIN: u8 = 0x01;
const WHEEL_MODE_RATCHET: u8 = 0x02;

// ============================================================================
// Status
// ============================================================================

/// Tri-state SmartShift status.
///
/// `None` means "not specified": the field is neither pushed to hardware
/// nor persisted. A field explicitly set to a value equal to the hardware
/// default is still `Some` and still round-trips through config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmartShiftStatus {
    /// Whether SmartShift (the ratchet with auto-disengage) is engaged
    pub active: Option<bool>,
    /// Auto-disengage threshold, in quarter wheel turns per second
    pub auto_disengage: Option<u8>,
    /// Threshold restored by the device on a default reset
    pub default_auto_disengage: Option<u8>,
}

impl SmartShiftStatus {
    /// Overlay `incoming` onto `self`, field by field.
    ///
    /// Fields the incoming status specifies always win; fields it leaves
    /// unset keep their current state. Repeating the same overlay is a
    /// no-op, and fields are independent of each other.
    pub fn merge(&mut self, incoming: &SmartShiftStatus) {
        if incoming.active.is_some() {
            self.active = incoming.active;
        }
        if incoming.auto_disengage.is_some() {
            self.auto_disengage = incoming.auto_disengage;
        }
        if incoming.default_auto_disengage.is_some() {
            self.default_auto_disengage = incoming.default_auto_disengage;
        }
    }

    /// Whether no field is specified
    pub fn is_unset(&self) -> bool {
        self.active.is_none()
            && self.auto_disengage.is_none()
            && self.default_auto_disengage.is_none()
    }

    /// Wire parameters for setRatchetControlMode.
    ///
    /// Unset fields encode as 0, which the device treats as "no change" —
    /// the wire format and the tri-state share the same shape.
    fn to_set_params(self) -> [u8; 3] {
        let mode = match self.active {
            Some(true) => WHEEL_MODE_RATCHET,
            Some(false) => WHEEL_MODE_FREESPIN,
            None => 0,
        };
        [
            mode,
            self.auto_disengage.unwrap_or(0),
            self.default_auto_disengage.unwrap_or(0),
        ]
    }

    /// Decode a getRatchetControlMode response payload.
    ///
    /// Live hardware values are always concrete, so every field comes back
    /// explicitly set.
    fn from_get_params(params: &[u8]) -> Result<Self, HidppError> {
        if params.len() < 3 {
            return Err(HidppError::Error { code: 0x03 });
        }
        Ok(Self {
            active: Some(params[0] == WHEEL_MODE_RATCHET),
            auto_disengage: Some(params[1]),
            default_auto_disengage: Some(params[2]),
        })
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Protocol client for one device's SmartShift feature.
///
/// Owns nothing but the shared transport handle and the feature index
/// resolved at construction; the two calls map 1:1 onto the feature's
/// get/set functions and never cache device state.
#[derive(Debug)]
pub struct SmartShiftBackend {
    device: SharedHidppDevice,
    feature_index: u8,
}

impl SmartShiftBackend {
    /// Resolve the SmartShift feature on the device.
    ///
    /// Fails with `HidppError::UnsupportedFeature` when the device's
    /// feature table has no SmartShift entry; the caller is expected to
    /// skip the feature for this device, not abort.
    pub fn new(device: &SharedHidppDevice) -> Result<Self, HidppError> {
        let feature_index = device
            .lock()
            .expect("hidpp device mutex poisoned")
            .feature_index(features::SMART_SHIFT)?;

        tracing::debug!(feature_index, "SmartShift feature resolved");

        Ok(Self {
            device: device.clone(),
            feature_index,
        })
    }

    /// Read the live status from hardware
    pub fn get_status(&self) -> Result<SmartShiftStatus, HidppError> {
        let response = self
            .device
            .lock()
            .expect("hidpp device mutex poisoned")
            .request(self.feature_index, FN_GET_STATUS, &[])?;

        SmartShiftStatus::from_get_params(&response[4..])
    }

    /// Push a status to hardware. Unset fields leave the device state
    /// untouched.
    pub fn set_status(&self, status: &SmartShiftStatus) -> Result<(), HidppError> {
        self.device
            .lock()
            .expect("hidpp device mutex poisoned")
            .request(self.feature_index, FN_SET_STATUS, &status.to_set_params())?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn full(active: bool, threshold: u8, default: u8) -> SmartShiftStatus {
        SmartShiftStatus {
            active: Some(active),
            auto_disengage: Some(threshold),
            default_auto_disengage: Some(default),
        }
    }

    #[test]
    fn test_default_is_unset() {
        let status = SmartShiftStatus::default();
        assert!(status.is_unset());
        assert_eq!(status.active, None);
    }

    #[test]
    fn test_merge_incoming_wins() {
        let mut base = full(true, 10, 20);
        base.merge(&full(false, 30, 40));
        assert_eq!(base, full(false, 30, 40));
    }

    #[test]
    fn test_merge_unset_fields_preserved() {
        let mut base = SmartShiftStatus {
            active: Some(true),
            ..Default::default()
        };
        base.merge(&SmartShiftStatus {
            auto_disengage: Some(7),
            ..Default::default()
        });

        assert_eq!(base.active, Some(true));
        assert_eq!(base.auto_disengage, Some(7));
        assert_eq!(base.default_auto_disengage, None);
    }

    #[test]
    fn test_merge_empty_incoming_is_noop() {
        let mut base = full(true, 10, 20);
        base.merge(&SmartShiftStatus::default());
        assert_eq!(base, full(true, 10, 20));
    }

    #[test]
    fn test_merge_idempotent() {
        let incoming = SmartShiftStatus {
            active: Some(false),
            auto_disengage: Some(15),
            ..Default::default()
        };

        let mut once = full(true, 10, 20);
        once.merge(&incoming);
        let mut twice = once;
        twice.merge(&incoming);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_explicit_default_still_set() {
        // A field set to the value it already holds stays explicitly set
        let mut base = SmartShiftStatus::default();
        base.merge(&SmartShiftStatus {
            auto_disengage: Some(0),
            ..Default::default()
        });
        assert_eq!(base.auto_disengage, Some(0));
        assert!(!base.is_unset());
    }

    #[test]
    fn test_set_params_encoding() {
        assert_eq!(full(true, 10, 20).to_set_params(), [0x02, 10, 20]);
        assert_eq!(full(false, 10, 20).to_set_params(), [0x01, 10, 20]);

        // Unset fields encode as "no change"
        assert_eq!(SmartShiftStatus::default().to_set_params(), [0, 0, 0]);
        let partial = SmartShiftStatus {
            auto_disengage: Some(30),
            ..Default::default()
        };
        assert_eq!(partial.to_set_params(), [0, 30, 0]);
    }

    #[test]
    fn test_get_params_decoding() {
        let status = SmartShiftStatus::from_get_params(&[0x02, 12, 30]).unwrap();
        assert_eq!(status, full(true, 12, 30));

        let status = SmartShiftStatus::from_get_params(&[0x01, 0, 30]).unwrap();
        assert_eq!(status.active, Some(false));

        assert!(SmartShiftStatus::from_get_params(&[0x02]).is_err());
    }
}
