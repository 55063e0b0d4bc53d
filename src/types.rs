use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use geo::MultiPolygon;

/// One attribute cell, normalized from dBASE or GeoJSON properties.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    /// Integer view of the cell. Text is trimmed and parsed; floats count
    /// when they carry no fractional part (dBASE stores integer columns as
    /// numerics).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            AttrValue::Text(s) => {
                let t = s.trim();
                t.parse::<i64>().ok().or_else(|| {
                    t.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Text(s) => f.write_str(s),
            AttrValue::Int(v) => write!(f, "{v}"),
            // Integral floats print without the trailing ".0" so section and
            // district numbers read like the dBASE table shows them.
            AttrValue::Float(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 => {
                write!(f, "{}", *v as i64)
            }
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Null => Ok(()),
        }
    }
}

/// District / section key. Values that parse as integers sort numerically,
/// everything else falls back to text; numbers order before text so mixed
/// columns still have a total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKey {
    Num(i64),
    Text(String),
}

impl FieldKey {
    pub fn from_attr(value: &AttrValue) -> FieldKey {
        match value.as_i64() {
            Some(v) => FieldKey::Num(v),
            None => FieldKey::Text(value.to_string().trim().to_string()),
        }
    }

    /// Zero-padded label for numeric keys ("Distrito 01"), raw text otherwise.
    pub fn padded_label(&self, width: usize) -> String {
        match self {
            FieldKey::Num(v) => format!("{v:0width$}"),
            FieldKey::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::Num(v) => write!(f, "{v}"),
            FieldKey::Text(s) => f.write_str(s),
        }
    }
}

/// One polygon record with its attribute row.
#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: MultiPolygon<f64>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Feature {
    /// Attribute lookup that treats nulls as absent.
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name).filter(|v| !v.is_null())
    }

    pub fn key(&self, column: &str) -> Option<FieldKey> {
        self.attr(column).map(FieldKey::from_attr)
    }
}

/// A named polygon layer: features plus the ordered column list.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub columns: Vec<String>,
    pub features: Vec<Feature>,
}

impl Layer {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Distinct non-null keys of a column, sorted.
    pub fn distinct_keys(&self, column: &str) -> Vec<FieldKey> {
        let set: BTreeSet<FieldKey> = self
            .features
            .iter()
            .filter_map(|f| f.key(column))
            .collect();
        set.into_iter().collect()
    }

    pub fn filtered(&self, mut pred: impl FnMut(&Feature) -> bool) -> Layer {
        Layer {
            name: self.name.clone(),
            columns: self.columns.clone(),
            features: self.features.iter().filter(|f| pred(f)).cloned().collect(),
        }
    }
}

/// Role columns guessed (or configured) for the secciones layer.
#[derive(Debug, Clone, Default)]
pub struct SectionColumns {
    pub entity: Option<String>,
    pub municipality: Option<String>,
    pub district_local: Option<String>,
    pub district_federal: Option<String>,
    pub section: Option<String>,
    pub block_count: Option<String>,
    pub voters: Option<String>,
    pub pop18: Option<String>,
}

/// Role columns guessed for the manzanas layer.
#[derive(Debug, Clone, Default)]
pub struct BlockColumns {
    pub section: Option<String>,
    pub pop18: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_as_i64_parses_text_and_integral_floats() {
        assert_eq!(AttrValue::Text(" 12 ".into()).as_i64(), Some(12));
        assert_eq!(AttrValue::Text("12.0".into()).as_i64(), Some(12));
        assert_eq!(AttrValue::Float(7.0).as_i64(), Some(7));
        assert_eq!(AttrValue::Float(7.5).as_i64(), None);
        assert_eq!(AttrValue::Text("abc".into()).as_i64(), None);
        assert_eq!(AttrValue::Null.as_i64(), None);
    }

    #[test]
    fn integral_floats_display_without_fraction() {
        assert_eq!(AttrValue::Float(101.0).to_string(), "101");
        assert_eq!(AttrValue::Float(0.25).to_string(), "0.25");
        assert_eq!(AttrValue::Null.to_string(), "");
    }

    #[test]
    fn field_keys_sort_numbers_before_text() {
        let mut keys = vec![
            FieldKey::Text("B12".into()),
            FieldKey::Num(10),
            FieldKey::Num(2),
            FieldKey::Text("A1".into()),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                FieldKey::Num(2),
                FieldKey::Num(10),
                FieldKey::Text("A1".into()),
                FieldKey::Text("B12".into()),
            ]
        );
    }

    #[test]
    fn padded_label_only_pads_numbers() {
        assert_eq!(FieldKey::Num(3).padded_label(2), "03");
        assert_eq!(FieldKey::Text("III".into()).padded_label(2), "III");
    }

    #[test]
    fn feature_attr_skips_nulls() {
        let mut attrs = BTreeMap::new();
        attrs.insert("SECCION".to_string(), AttrValue::Null);
        let feature = Feature {
            geometry: MultiPolygon::new(vec![]),
            attrs,
        };
        assert!(feature.attr("SECCION").is_none());
        assert!(feature.key("SECCION").is_none());
    }
}
