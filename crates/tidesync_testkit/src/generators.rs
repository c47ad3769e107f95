//! Test data and generators.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tidesync_core::{DataObject, ObjectKey};

/// Type name of [`TestData`].
pub const TEST_DATA_TYPE: &str = "TestData";

/// A small object type for tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestData {
    /// Key.
    pub id: String,
    /// Payload.
    pub text: String,
}

impl TestData {
    /// Creates an object.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

impl DataObject for TestData {
    const TYPE_NAME: &'static str = TEST_DATA_TYPE;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// The `n`th generated key: `("TestData", "<n>")`.
pub fn generate_key(n: u32) -> ObjectKey {
    ObjectKey::new(TEST_DATA_TYPE, n.to_string())
}

/// The `n`th generated object, stored under [`generate_key`]`(n)`.
pub fn generate_data(n: u32) -> TestData {
    TestData::new(n.to_string(), format!("test data {n}"))
}

/// Strategy for arbitrary test objects with short numeric keys.
pub fn test_data_strategy() -> impl Strategy<Value = TestData> {
    (0u32..64, "[a-z ]{0,24}").prop_map(|(id, text)| TestData::new(id.to_string(), text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_matches_data() {
        let data = generate_data(7);
        assert_eq!(generate_key(7), ObjectKey::new(TestData::TYPE_NAME, data.key()));
        assert_eq!(data.text, "test data 7");
    }

    proptest! {
        #[test]
        fn strategy_keys_are_numeric(data in test_data_strategy()) {
            prop_assert!(data.id.parse::<u32>().is_ok());
        }
    }
}
