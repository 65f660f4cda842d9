use crate::DataError;

/// Length oracle for prompt fitting, so few-shot assembly can be tested
/// without shipping a tokenizer model file.
pub trait TokenCount {
    fn token_count(&self, text: &str) -> Result<usize, DataError>;
}

impl TokenCount for tokenizers::Tokenizer {
    fn token_count(&self, text: &str) -> Result<usize, DataError> {
        let encoding = self
            .encode(text, true)
            .map_err(|e| DataError::Tokenizer(e.to_string()))?;
        Ok(encoding.len())
    }
}
