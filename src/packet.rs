use serde::{Deserialize, Serialize};

use crate::types::{Field, FieldMap, Value};

#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// A located packet: a finite map from header fields to values.
///
/// The concrete wire representation and I/O live in the controller; the
/// policy core only reads fields, rewrites them in bulk, and compares
/// packets for set membership. Absent fields are simply missing from the
/// map, so [`Value::None`] never appears in a packet.
pub struct Packet {
    fields: FieldMap,
}

impl Packet {
    /// Creates a packet with no fields set.
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Reads a field, or `None` if the packet does not carry it.
    pub fn get(&self, field: &Field) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a copy with every listed field rewritten. A [`Value::None`]
    /// entry removes the field.
    pub fn modify_many(&self, updates: &FieldMap) -> Packet {
        let mut fields = self.fields.clone();
        for (field, value) in updates {
            match value {
                Value::None => {
                    fields.remove(field);
                }
                v => {
                    fields.insert(field.clone(), v.clone());
                }
            }
        }
        Packet { fields }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, field: Field, value: impl Into<Value>) -> Packet {
        self.fields.insert(field, value.into());
        self
    }

    /// All fields carried by the packet.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }
}

impl FromIterator<(Field, Value)> for Packet {
    fn from_iter<I: IntoIterator<Item = (Field, Value)>>(iter: I) -> Packet {
        Packet {
            fields: iter.into_iter().collect(),
        }
    }
}
