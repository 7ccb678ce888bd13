//! Attribute domains: ordered collections of categorical attributes.

use std::collections::BTreeMap;
use std::path::Path;

use crate::clique::Clique;
use crate::error::{Error, Result};

/// An ordered collection of categorical attributes with finite cardinality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Domain {
    attrs: Vec<String>,
    shape: Vec<usize>,
}

impl Domain {
    /// Create a domain from parallel attribute/cardinality lists.
    pub fn new<I, S>(attrs: I, shape: Vec<usize>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attrs: Vec<String> = attrs.into_iter().map(Into::into).collect();
        if attrs.len() != shape.len() {
            return Err(Error::invalid(format!(
                "domain has {} attributes but {} cardinalities",
                attrs.len(),
                shape.len()
            )));
        }
        for (a, &n) in attrs.iter().zip(shape.iter()) {
            if n == 0 {
                return Err(Error::invalid(format!(
                    "attribute `{a}` has zero cardinality"
                )));
            }
        }
        for (i, a) in attrs.iter().enumerate() {
            if attrs[..i].contains(a) {
                return Err(Error::invalid(format!("duplicate attribute `{a}`")));
            }
        }
        Ok(Self { attrs, shape })
    }

    /// Parse a domain from a JSON object mapping attribute to cardinality.
    ///
    /// Attributes are ordered by name so that the result is independent of
    /// the JSON key order.
    pub fn from_json(text: &str) -> Result<Self> {
        let map: BTreeMap<String, usize> = serde_json::from_str(text)
            .map_err(|e| Error::parse(format!("domain json: {e}")))?;
        let (attrs, shape): (Vec<String>, Vec<usize>) = map.into_iter().unzip();
        Domain::new(attrs, shape)
    }

    /// Load a domain from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Domain::from_json(&text)
    }

    /// The attribute names in domain order.
    pub fn attrs(&self) -> &[String] {
        &self.attrs
    }

    /// Per-attribute cardinalities, parallel to [`Domain::attrs`].
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True when the domain has no attributes.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Membership test.
    pub fn contains(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }

    /// Position of an attribute in domain order.
    pub fn index_of(&self, attr: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a == attr)
    }

    /// Cardinality of one attribute.
    pub fn cardinality(&self, attr: &str) -> Result<usize> {
        self.index_of(attr)
            .map(|i| self.shape[i])
            .ok_or_else(|| Error::UnknownAttribute {
                attr: attr.to_string(),
            })
    }

    /// Sub-domain over the clique's attributes, in canonical clique order.
    pub fn project(&self, clique: &Clique) -> Result<Domain> {
        let mut attrs = Vec::with_capacity(clique.len());
        let mut shape = Vec::with_capacity(clique.len());
        for attr in clique.iter() {
            shape.push(self.cardinality(attr)?);
            attrs.push(attr.to_string());
        }
        Ok(Domain { attrs, shape })
    }

    /// Product of cardinalities over the clique's attributes.
    pub fn size_of(&self, clique: &Clique) -> Result<usize> {
        let mut size = 1usize;
        for attr in clique.iter() {
            size = size.saturating_mul(self.cardinality(attr)?);
        }
        Ok(size)
    }

    /// Product of all cardinalities.
    pub fn total_size(&self) -> usize {
        self.shape.iter().fold(1usize, |acc, &n| acc.saturating_mul(n))
    }

    /// All attributes of the domain, as a clique.
    pub fn attr_clique(&self) -> Clique {
        Clique::new(self.attrs.iter().cloned())
    }

    /// Union of two domains; fails if a shared attribute's cardinalities
    /// disagree. Attributes of `self` keep their order, new attributes of
    /// `other` follow.
    pub fn merge(a: &Domain, b: &Domain) -> Result<Domain> {
        let mut attrs = a.attrs.clone();
        let mut shape = a.shape.clone();
        for (attr, &n) in b.attrs.iter().zip(b.shape.iter()) {
            match a.index_of(attr) {
                Some(i) => {
                    if a.shape[i] != n {
                        return Err(Error::DomainMismatch {
                            attr: attr.clone(),
                            left: a.shape[i],
                            right: n,
                        });
                    }
                }
                None => {
                    attrs.push(attr.clone());
                    shape.push(n);
                }
            }
        }
        Ok(Domain { attrs, shape })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Domain {
        Domain::new(["a", "b", "c"], vec![2, 3, 4]).unwrap()
    }

    #[test]
    fn project_follows_canonical_order() {
        let d = abc();
        let sub = d.project(&Clique::new(["c", "a"])).unwrap();
        assert_eq!(sub.attrs(), ["a", "c"]);
        assert_eq!(sub.shape(), [2, 4]);
    }

    #[test]
    fn size_is_product() {
        let d = abc();
        assert_eq!(d.size_of(&Clique::new(["a", "b"])).unwrap(), 6);
        assert_eq!(d.total_size(), 24);
    }

    #[test]
    fn merge_rejects_conflicts() {
        let d1 = abc();
        let d2 = Domain::new(["b", "d"], vec![3, 5]).unwrap();
        let merged = Domain::merge(&d1, &d2).unwrap();
        assert_eq!(merged.attrs(), ["a", "b", "c", "d"]);

        let bad = Domain::new(["b"], vec![7]).unwrap();
        assert!(matches!(
            Domain::merge(&d1, &bad),
            Err(Error::DomainMismatch { .. })
        ));
    }

    #[test]
    fn json_roundtrip() {
        let d = Domain::from_json(r#"{"age": 5, "sex": 2}"#).unwrap();
        assert_eq!(d.attrs(), ["age", "sex"]);
        assert_eq!(d.shape(), [5, 2]);
        assert!(Domain::from_json("not json").is_err());
    }
}
