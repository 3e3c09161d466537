//! Case identity

use std::fmt;

use crate::error::{Error, Result};

/// Validated case identifier; used verbatim in every file name of the case.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CaseId(String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.chars().any(char::is_control);
        if !valid {
            return Err(Error::InvalidCaseId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{caseID}.{ext}`, the name an inference pass writes.
    pub fn segmentation_file(&self, extension: &str) -> String {
        format!("{}.{extension}", self.0)
    }

    /// `{caseID}_seg_final.{ext}`
    pub fn final_file(&self, extension: &str) -> String {
        format!("{}_seg_final.{extension}", self.0)
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
