use std::collections::BTreeMap;

use thiserror::Error;

use crate::classifier::{Action, Classifier, Rule};
use crate::policy::Policy;
use crate::pred::{Match, Pred};
use crate::types::{Field, FieldMap, Value};

/// Bits of the VLAN id header available as tag space.
pub const VLAN_ID_BITS: u32 = 12;
/// Bits of the VLAN priority header available as tag space.
pub const VLAN_PCP_BITS: u32 = 3;

#[derive(Error, Debug)]
pub enum VirtualFieldError {
    #[error("virtual field {0:?} is not registered")]
    UnknownField(String),
    #[error("value {value} is not in the domain of virtual field {field:?}")]
    UnknownValue { field: String, value: Value },
    #[error("virtual fields need {required} encodings but the vlan space holds {capacity}")]
    Overflow { required: u64, capacity: u64 },
}

#[derive(Clone, Debug, Default)]
/// Registry of logical per-packet fields and their value domains.
///
/// All registered fields are packed together into the two physical VLAN
/// headers by a mixed-radix encoding: each field contributes a digit of
/// `domain size + 1` values, digit 0 meaning "absent". The combined index 0
/// (every field absent) encodes as an absent VLAN tag.
pub struct VirtualFields {
    fields: BTreeMap<String, Vec<Value>>,
}

impl VirtualFields {
    pub fn new() -> VirtualFields {
        VirtualFields::default()
    }

    /// Registers (or re-registers) a virtual field with its value domain.
    pub fn register(&mut self, name: &str, values: Vec<Value>) -> Result<(), VirtualFieldError> {
        let mut fields = self.fields.clone();
        fields.insert(name.to_string(), values);
        let required: u64 = fields.values().map(|v| v.len() as u64 + 1).product();
        let capacity = 1u64 << (VLAN_ID_BITS + VLAN_PCP_BITS);
        if required > capacity {
            return Err(VirtualFieldError::Overflow { required, capacity });
        }
        self.fields = fields;
        Ok(())
    }

    /// The registered field names, in encoding order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// The combined mixed-radix index of a (possibly partial) assignment of
    /// virtual fields. Unmentioned fields count as absent.
    fn compress(&self, assignment: &BTreeMap<&str, &Value>) -> Result<u64, VirtualFieldError> {
        for name in assignment.keys() {
            if !self.fields.contains_key(*name) {
                return Err(VirtualFieldError::UnknownField(name.to_string()));
            }
        }
        let mut index = 0u64;
        for (name, domain) in &self.fields {
            let digit = match assignment.get(name.as_str()) {
                None | Some(Value::None) => 0,
                Some(value) => {
                    domain
                        .iter()
                        .position(|v| v == *value)
                        .ok_or_else(|| VirtualFieldError::UnknownValue {
                            field: name.clone(),
                            value: (*value).clone(),
                        })? as u64
                        + 1
                }
            };
            index = index * (domain.len() as u64 + 1) + digit;
        }
        Ok(index)
    }

    /// The VLAN encoding of a combined index: absent VLAN headers for index
    /// 0, otherwise the low bits in `vlan_id` and the high bits in
    /// `vlan_pcp`.
    fn vlan_of(index: u64) -> [(Field, Value); 2] {
        if index == 0 {
            [(Field::VlanId, Value::None), (Field::VlanPcp, Value::None)]
        } else {
            [
                (Field::VlanId, Value::Int(index & ((1u64 << VLAN_ID_BITS) - 1))),
                (Field::VlanPcp, Value::Int(index >> VLAN_ID_BITS)),
            ]
        }
    }

    /// Splits a field map into its compilable part and its virtual part.
    fn split(map: &FieldMap) -> (FieldMap, BTreeMap<&str, &Value>) {
        let mut physical = FieldMap::new();
        let mut virtual_part = BTreeMap::new();
        for (field, value) in map {
            match field {
                Field::Virtual(name) => {
                    virtual_part.insert(name.as_str(), value);
                }
                other => {
                    physical.insert(other.clone(), value.clone());
                }
            }
        }
        (physical, virtual_part)
    }

    fn translate_map(&self, map: &FieldMap) -> Result<FieldMap, VirtualFieldError> {
        let (mut physical, virtual_part) = Self::split(map);
        if virtual_part.is_empty() {
            return Ok(physical);
        }
        let index = self.compress(&virtual_part)?;
        for (field, value) in Self::vlan_of(index) {
            physical.insert(field, value);
        }
        Ok(physical)
    }

    /// Rewrites a match over virtual fields into one over VLAN bits.
    pub fn translate_match(&self, m: &Match) -> Result<Match, VirtualFieldError> {
        Ok(Match::from_map(self.translate_map(&m.map)?))
    }

    /// Rewrites a modify over virtual fields into one over VLAN bits.
    pub fn translate_modify(&self, map: &FieldMap) -> Result<FieldMap, VirtualFieldError> {
        self.translate_map(map)
    }

    /// Rewrites a whole classifier for installation: every rule match and
    /// every modify action loses its virtual fields in favor of their VLAN
    /// encoding.
    pub fn translate_classifier(
        &self,
        classifier: &Classifier,
    ) -> Result<Classifier, VirtualFieldError> {
        let mut rules = Vec::with_capacity(classifier.rules.len());
        for rule in &classifier.rules {
            let pattern = self.translate_match(&rule.pattern)?;
            let mut actions = Vec::with_capacity(rule.actions.len());
            for action in &rule.actions {
                actions.push(match action {
                    Action::Modify(m) => Action::Modify(self.translate_modify(m)?),
                    other => other.clone(),
                });
            }
            rules.push(Rule::new(pattern, actions));
        }
        Ok(Classifier::new(rules))
    }

    /// The policy clearing all tag bits at network egress: packets leaving
    /// the network carry no trace of the virtual fields.
    pub fn untagging(&self, egress: &Pred) -> Policy {
        let clear = FieldMap::from([
            (Field::VlanId, Value::None),
            (Field::VlanPcp, Value::None),
        ]);
        (Policy::Filter(egress.clone()) >> Policy::Modify(clear))
            + Policy::Filter(!egress.clone())
    }
}
