use alloc::string::String;
use core::fmt;

use crate::entry::EntryPoint;
use crate::vmx::VmcsField;

/// Errors reported by the loader, the lifecycle manager and the VMCS checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmmError {
    /// A null or empty argument was supplied.
    InvalidArgument,
    /// The platform could not provide the requested memory.
    OutOfMemory,
    /// The image table is full.
    CapacityExceeded,
    /// The operation needs at least one image.
    NoImagesLoaded,
    /// The operation is not legal in the current [`VmmStatus`](crate::VmmStatus).
    InvalidState,
    /// An image could not be parsed, placed or relocated.
    FormatError,
    /// A symbol could not be resolved.
    SymbolNotFound(String),
    /// An entry point of the VMM returned a failure status.
    EntryFailure {
        /// The entry point that was invoked.
        entry: EntryPoint,
        /// The status code it returned.
        status: i64,
    },
    /// A rollback failed earlier; only a full reset is accepted now.
    VmmCorrupted,
    /// A field of the current VMCS could not be read.
    VmcsReadFailed(VmcsField),
    /// A control field violates the allowed-0/allowed-1 settings of its capability MSR.
    InvalidControlBits {
        name: &'static str,
        low: u32,
        high: u32,
        field_low: u32,
        field_high: u32,
    },
    /// A control field holds an illegal value.
    InvalidField {
        rule: &'static str,
        reason: &'static str,
        value: u64,
        /// The capability MSR or processor value consulted by the rule, if any.
        capability: Option<u64>,
    },
    /// An address is null or exceeds the physical-address width.
    InvalidAddress {
        rule: &'static str,
        reason: &'static str,
        addr: u64,
    },
    /// An address does not have the required alignment.
    MisalignedAddress {
        rule: &'static str,
        reason: &'static str,
        addr: u64,
    },
}

impl VmmError {
    /// Returns `true` for errors raised by the VMCS control checks.
    pub fn is_vmcs_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidControlBits { .. }
                | Self::InvalidField { .. }
                | Self::InvalidAddress { .. }
                | Self::MisalignedAddress { .. }
        )
    }

    /// The name of the check that raised this error, if it came from the VMCS checks.
    pub fn rule(&self) -> Option<&'static str> {
        match self {
            Self::InvalidControlBits { name, .. } => Some(*name),
            Self::InvalidField { rule, .. }
            | Self::InvalidAddress { rule, .. }
            | Self::MisalignedAddress { rule, .. } => Some(*rule),
            _ => None,
        }
    }
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::CapacityExceeded => write!(f, "maximum number of images reached"),
            Self::NoImagesLoaded => write!(f, "no images added"),
            Self::InvalidState => write!(f, "operation not allowed in the current VMM state"),
            Self::FormatError => write!(f, "malformed VMM image"),
            Self::SymbolNotFound(name) => write!(f, "symbol not found: {name}"),
            Self::EntryFailure { entry, status } => {
                write!(f, "entry `{}` failed with status {status:#x}", entry.symbol())
            }
            Self::VmmCorrupted => write!(f, "VMM is corrupted"),
            Self::VmcsReadFailed(field) => write!(f, "failed to read VMCS field {field:?}"),
            Self::InvalidControlBits {
                name,
                low,
                high,
                field_low,
                field_high,
            } => write!(
                f,
                "invalid {name} controls: allowed0 {low:#x}, allowed1 {high:#x}, \
                 field {field_high:#x}:{field_low:#x}"
            ),
            Self::InvalidField {
                rule,
                reason,
                value,
                capability,
            } => {
                write!(f, "{rule}: {reason} (value {value:#x}")?;
                if let Some(cap) = capability {
                    write!(f, ", capability {cap:#x}")?;
                }
                write!(f, ")")
            }
            Self::InvalidAddress { rule, reason, addr } => {
                write!(f, "{rule}: {reason} (address {addr:#x})")
            }
            Self::MisalignedAddress { rule, reason, addr } => {
                write!(f, "{rule}: {reason} (address {addr:#x})")
            }
        }
    }
}

impl core::error::Error for VmmError {}

/// The result type used throughout this crate.
pub type Result<T = ()> = core::result::Result<T, VmmError>;
