use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A packet of data flowing through the engine
///
/// Node inputs, node outputs, and instance trigger data are all arbitrary
/// JSON; this wrapper keeps the conversions in one place.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct DataPacket {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl DataPacket {
    /// Create a new data packet from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null data packet
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Create an empty-object data packet
    #[inline]
    pub fn empty_object() -> Self {
        Self {
            value: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the data packet is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to view the data packet as a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Try to view the data packet as a number
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Try to view the data packet as a boolean
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    /// Try to view the data packet as an object
    #[inline]
    pub fn as_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.value.as_object()
    }

    /// Get a field from an object packet
    #[inline]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.value.get(key)
    }

    /// Deserialize the data packet into a concrete type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a data packet from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Merge another object packet over this one, field by field
    ///
    /// Non-object packets are replaced wholesale.
    pub fn merge(&mut self, other: &DataPacket) {
        match (&mut self.value, other.as_value()) {
            (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
                for (k, v) in overlay {
                    base.insert(k.clone(), v.clone());
                }
            }
            (slot, overlay) => {
                *slot = overlay.clone();
            }
        }
    }
}

impl From<serde_json::Value> for DataPacket {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}
