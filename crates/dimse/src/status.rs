//! DIMSE status codes (PS3.7 Annex C).

use std::fmt;

/// Broad classification of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    /// More responses follow for the same request.
    Pending,
    Warning,
    Failure,
    Cancel,
}

/// A raw status code as carried in the Status (0000,0900) command element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const PENDING: Status = Status(0xFF00);
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const CANCEL: Status = Status(0xFE00);
    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const OUT_OF_RESOURCES: Status = Status(0xA700);
    pub const UNABLE_TO_PROCESS: Status = Status(0xC000);

    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    pub const fn code(self) -> u16 {
        self.0
    }

    pub fn class(self) -> StatusClass {
        match self.0 {
            0x0000 => StatusClass::Success,
            0xFF00 | 0xFF01 => StatusClass::Pending,
            0xFE00 => StatusClass::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusClass::Warning,
            _ => StatusClass::Failure,
        }
    }

    pub fn is_success(self) -> bool {
        self.class() == StatusClass::Success
    }

    pub fn is_pending(self) -> bool {
        self.class() == StatusClass::Pending
    }

    pub fn is_warning(self) -> bool {
        self.class() == StatusClass::Warning
    }

    pub fn is_failure(self) -> bool {
        self.class() == StatusClass::Failure
    }

    /// Human readable meaning of common codes.
    pub fn description(self) -> &'static str {
        match self.0 {
            0x0000 => "Success",
            0xFF00 => "Pending",
            0xFF01 => "Pending, optional keys not supported",
            0xFE00 => "Cancelled",
            0x0001 => "Requested optional attributes are not supported",
            0x0107 => "Attribute list error",
            0x0116 => "Attribute value out of range",
            0xB000 => "Coercion of data elements",
            0xB006 => "Elements discarded",
            0xB007 => "Data set does not match SOP class",
            0xB001..=0xBFFF => "Warning",
            0x0110 => "Processing failure",
            0x0111 => "Duplicate SOP instance",
            0x0112 => "No such SOP instance",
            0x0117 => "Invalid object instance",
            0x0118 => "No such SOP class",
            0x0119 => "Class-instance conflict",
            0x0122 => "SOP class not supported",
            0x0124 => "Not authorized",
            0x0210 => "Duplicate invocation",
            0x0211 => "Unrecognized operation",
            0x0212 => "Mistyped argument",
            0x0213 => "Resource limitation",
            0xA701 => "Out of resources: unable to calculate number of matches",
            0xA702 => "Out of resources: unable to perform sub-operations",
            0xA700..=0xA7FF => "Out of resources",
            0xA801 => "Move destination unknown",
            0xA900..=0xA9FF => "Data set does not match SOP class",
            0xC000..=0xCFFF => "Unable to process",
            _ => "Unknown status",
        }
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(Status::new(0x0000).class(), StatusClass::Success);
        assert_eq!(Status::new(0xFF00).class(), StatusClass::Pending);
        assert_eq!(Status::new(0xFF01).class(), StatusClass::Pending);
        assert_eq!(Status::new(0xFE00).class(), StatusClass::Cancel);
        assert_eq!(Status::new(0xB000).class(), StatusClass::Warning);
        assert_eq!(Status::new(0x0107).class(), StatusClass::Warning);
        assert_eq!(Status::new(0xA700).class(), StatusClass::Failure);
        assert_eq!(Status::new(0xC123).class(), StatusClass::Failure);
        assert_eq!(Status::new(0x0122).class(), StatusClass::Failure);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::new(0xA801).to_string(), "0xA801 (Move destination unknown)");
    }
}
