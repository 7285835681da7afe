//! Static dataset configuration shared by every component.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DashError;

/// Structure and behaviour of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetConfig {
    pub table: &'static str,
    pub key_field: &'static str,
    pub title_field: &'static str,
    pub category_field: Option<&'static str>,
    pub theme_field: &'static str,
    pub subtheme_field: Option<&'static str>,
    pub ai_functions: &'static [&'static str],
}

impl DatasetConfig {
    pub fn supports(&self, function: &str) -> bool {
        self.ai_functions.contains(&function)
    }
}

/// The four fixed record collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Controls,
    InternalLoss,
    ExternalLoss,
    Issues,
}

const ISSUES: DatasetConfig = DatasetConfig {
    table: "issues_raw",
    key_field: "issue_id",
    title_field: "issue_title",
    category_field: Some("issues_type"),
    theme_field: "risk_theme",
    subtheme_field: Some("risk_subtheme"),
    ai_functions: &["issue_taxonomy", "root_cause", "enrichment", "slow_enrichment"],
};

const CONTROLS: DatasetConfig = DatasetConfig {
    table: "controls_raw",
    key_field: "control_id",
    title_field: "control_title",
    category_field: Some("key_control"),
    theme_field: "risk_theme",
    subtheme_field: Some("risk_subtheme"),
    ai_functions: &["controls_taxonomy", "root_cause", "enrichment", "slow_enrichment"],
};

const EXTERNAL_LOSS: DatasetConfig = DatasetConfig {
    table: "external_loss_raw",
    key_field: "reference_id_code",
    title_field: "description_of_event",
    category_field: Some("parent_name"),
    theme_field: "risk_theme",
    subtheme_field: Some("risk_subtheme"),
    ai_functions: &["issue_taxonomy", "root_cause", "enrichment", "slow_enrichment"],
};

const INTERNAL_LOSS: DatasetConfig = DatasetConfig {
    table: "internal_loss_raw",
    key_field: "event_id",
    title_field: "event_title",
    category_field: Some("event_type"),
    theme_field: "risk_theme",
    subtheme_field: Some("risk_subtheme"),
    ai_functions: &["issue_taxonomy", "root_cause", "enrichment", "slow_enrichment"],
};

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::Controls,
        Dataset::InternalLoss,
        Dataset::ExternalLoss,
        Dataset::Issues,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controls => "controls",
            Self::InternalLoss => "internal_loss",
            Self::ExternalLoss => "external_loss",
            Self::Issues => "issues",
        }
    }

    pub fn config(self) -> &'static DatasetConfig {
        match self {
            Self::Controls => &CONTROLS,
            Self::InternalLoss => &INTERNAL_LOSS,
            Self::ExternalLoss => &EXTERNAL_LOSS,
            Self::Issues => &ISSUES,
        }
    }

    /// Name of the result cache table for one of this dataset's functions.
    pub fn cache_table(self, function: &str) -> String {
        format!("{}_{function}", self.as_str())
    }

    /// Validate `function` against this dataset's declared function list.
    pub fn require_function(self, function: &str) -> Result<(), DashError> {
        if self.config().supports(function) {
            Ok(())
        } else {
            Err(DashError::invalid(format!(
                "Invalid function '{function}' for dataset '{}'. Valid options: {}",
                self.as_str(),
                self.config().ai_functions.join(", ")
            )))
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = DashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| DashError::invalid(format!("Unknown dataset '{s}'")))
    }
}

/// Look up a dataset's configuration by name.
pub fn get_dataset_config(name: &str) -> Result<&'static DatasetConfig, DashError> {
    name.parse::<Dataset>().map(Dataset::config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn names_round_trip() {
        for dataset in Dataset::ALL {
            assert_eq!(dataset.as_str().parse::<Dataset>().unwrap(), dataset);
        }
    }

    #[test]
    fn unknown_dataset_is_invalid_argument() {
        let err = get_dataset_config("payments").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("payments"));
    }

    #[test]
    fn function_names_unique_per_dataset() {
        for dataset in Dataset::ALL {
            let functions = dataset.config().ai_functions;
            let unique: HashSet<_> = functions.iter().collect();
            assert_eq!(unique.len(), functions.len(), "{dataset}");
        }
    }

    #[test]
    fn raw_tables_and_keys_are_distinct() {
        let tables: HashSet<_> = Dataset::ALL.iter().map(|d| d.config().table).collect();
        assert_eq!(tables.len(), 4);
        assert_eq!(Dataset::Issues.config().key_field, "issue_id");
        assert_eq!(Dataset::ExternalLoss.config().key_field, "reference_id_code");
    }

    #[test]
    fn cache_table_naming() {
        assert_eq!(Dataset::Issues.cache_table("root_cause"), "issues_root_cause");
        assert_eq!(
            Dataset::InternalLoss.cache_table("enrichment"),
            "internal_loss_enrichment"
        );
    }

    #[test]
    fn require_function_lists_valid_options() {
        assert!(Dataset::Controls.require_function("controls_taxonomy").is_ok());
        let err = Dataset::Controls
            .require_function("issue_taxonomy")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("controls_taxonomy"));
    }
}
