//! Common types for DIMSE operations

use dicom_dictionary_std::uids;
use serde::{Deserialize, Serialize};

use crate::message::{tags, CommandSet};

/// DIMSE-C operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DimseCommand {
    /// C-ECHO command
    Echo,
    /// C-FIND command
    Find,
    /// C-STORE command
    Store,
    /// C-MOVE command
    Move,
    /// C-GET command
    Get,
}

impl DimseCommand {
    pub const fn name(self) -> &'static str {
        match self {
            DimseCommand::Echo => "C-ECHO",
            DimseCommand::Find => "C-FIND",
            DimseCommand::Store => "C-STORE",
            DimseCommand::Move => "C-MOVE",
            DimseCommand::Get => "C-GET",
        }
    }
}

impl std::fmt::Display for DimseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Priority (0000,0700) of a C-STORE, C-FIND, C-MOVE or C-GET request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority
    Low,
    /// Medium priority (default)
    #[default]
    Medium,
    /// High priority
    High,
}

impl Priority {
    pub const fn code(self) -> u16 {
        match self {
            Priority::Low => 0x0002,
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0002 => Some(Priority::Low),
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            _ => None,
        }
    }
}

/// Query/Retrieve information model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryRetrieveModel {
    PatientRoot,
    #[default]
    StudyRoot,
}

impl QueryRetrieveModel {
    pub const fn find_sop_class(self) -> &'static str {
        match self {
            QueryRetrieveModel::PatientRoot => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            QueryRetrieveModel::StudyRoot => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        }
    }

    pub const fn move_sop_class(self) -> &'static str {
        match self {
            QueryRetrieveModel::PatientRoot => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
            QueryRetrieveModel::StudyRoot => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        }
    }

    pub const fn get_sop_class(self) -> &'static str {
        match self {
            QueryRetrieveModel::PatientRoot => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            QueryRetrieveModel::StudyRoot => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
        }
    }
}

/// Sub-operation counters carried by C-MOVE and C-GET responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubOperationCounters {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperationCounters {
    /// Read the counters from a response command set; absent counters are 0.
    pub fn from_command(command: &CommandSet) -> Self {
        let read = |tag| command.get_u16(tag).unwrap_or(0);
        Self {
            remaining: read(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: read(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: read(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: read(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }

    pub fn total(&self) -> u32 {
        self.remaining as u32 + self.completed as u32 + self.failed as u32 + self.warning as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandValue;

    #[test]
    fn test_priority_codes() {
        assert_eq!(Priority::default(), Priority::Medium);
        for p in [Priority::Low, Priority::Medium, Priority::High] {
            assert_eq!(Priority::from_code(p.code()), Some(p));
        }
        assert_eq!(Priority::from_code(7), None);
    }

    #[test]
    fn test_counters_from_command() {
        let command = CommandSet::new()
            .with(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, CommandValue::U16(3))
            .with(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, CommandValue::U16(2))
            .with(tags::NUMBER_OF_FAILED_SUBOPERATIONS, CommandValue::U16(1));
        let counters = SubOperationCounters::from_command(&command);
        assert_eq!(
            counters,
            SubOperationCounters {
                remaining: 3,
                completed: 2,
                failed: 1,
                warning: 0
            }
        );
        assert_eq!(counters.total(), 6);
    }

    #[test]
    fn test_model_sop_classes() {
        assert_eq!(
            QueryRetrieveModel::StudyRoot.find_sop_class(),
            "1.2.840.10008.5.1.4.1.2.2.1"
        );
        assert_eq!(
            QueryRetrieveModel::PatientRoot.get_sop_class(),
            "1.2.840.10008.5.1.4.1.2.1.3"
        );
    }
}
