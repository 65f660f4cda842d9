use thiserror::Error;

/// Dataset files known to the harness, addressed by integer id on the
/// command line.
const DATASET_FILES: &[&str] = &[
    "boolq.json",
    "narrative_qa.json",
    "natural_qa_closedbook.json",
    "natural_qa_openbook_longans.json",
    "quac.json",
    "hellaswag.json",
    "openbookqa.json",
    "truthful_qa.json",
    "mmlu.json",
    "msmarco_regular.json",
    "msmarco_trec.json",
];

/// Prompt prefixes, addressed by integer id. Id 0 is the empty prefix.
const PROMPT_PREFIXES: &[&str] = &[
    "",
    "Answer the question.\n\n",
    "Answer the question with a short phrase.\n\n",
    "Read the passage and answer the question.\n\n",
    "Complete the sentence.\n\n",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown dataset id {0}")]
    UnknownDatasetId(usize),

    #[error("unknown prompt id {0}")]
    UnknownPromptId(usize),
}

pub fn dataset_file(data_id: usize) -> Result<&'static str, RegistryError> {
    DATASET_FILES
        .get(data_id)
        .copied()
        .ok_or(RegistryError::UnknownDatasetId(data_id))
}

pub fn prompt_prefix(p_id: usize) -> Result<&'static str, RegistryError> {
    PROMPT_PREFIXES
        .get(p_id)
        .copied()
        .ok_or(RegistryError::UnknownPromptId(p_id))
}

/// Dataset name as used in logs and output filenames: the file stem.
pub fn data_name(dataset_file: &str) -> String {
    dataset_file
        .strip_suffix(".json")
        .unwrap_or(dataset_file)
        .to_string()
}

pub fn is_msmarco(data_name: &str) -> bool {
    matches!(data_name, "msmarco_regular" | "msmarco_trec")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_resolve() {
        assert_eq!(dataset_file(0).unwrap(), "boolq.json");
        assert_eq!(prompt_prefix(0).unwrap(), "");
    }

    #[test]
    fn unknown_ids_are_rejected() {
        assert_eq!(
            dataset_file(999).unwrap_err(),
            RegistryError::UnknownDatasetId(999)
        );
        assert_eq!(
            prompt_prefix(999).unwrap_err(),
            RegistryError::UnknownPromptId(999)
        );
    }

    #[test]
    fn data_name_is_the_file_stem() {
        assert_eq!(data_name("msmarco_trec.json"), "msmarco_trec");
        assert_eq!(data_name("boolq"), "boolq");
    }

    #[test]
    fn msmarco_detection_is_by_name() {
        assert!(is_msmarco("msmarco_regular"));
        assert!(is_msmarco("msmarco_trec"));
        assert!(!is_msmarco("boolq"));
    }
}
