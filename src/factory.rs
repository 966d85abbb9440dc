//! # Element Factory
//!
//! Builds elements from their wire form: a type name plus an optional string
//! value. Construction is pure; a missing value yields the type's default.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::element::{ElemSet, ElemType, Element, ElementError};

/// Creates elements by wire type name
pub struct ElementFactory;

impl ElementFactory {
    /// Every type name the factory understands
    pub const TYPE_NAMES: &'static [&'static str] = &[
        "null",
        "bool",
        "u32",
        "i32",
        "txt",
        "ipv4",
        "ipv6",
        "ipv4net",
        "ipv6net",
        "set",
        "set_u32",
        "set_i32",
        "set_ipv4",
        "set_ipv6",
        "set_ipv4net",
        "set_ipv6net",
    ];

    /// Returns true if elements of `type_name` can be created
    pub fn can_create(type_name: &str) -> bool {
        Self::TYPE_NAMES.contains(&type_name)
    }

    /// Creates an element of `type_name` from its string form.
    ///
    /// # Examples
    /// ```
    /// use policy_vm::{Element, ElementFactory};
    ///
    /// let e = ElementFactory::create("u32", Some("42")).unwrap();
    /// assert_eq!(e, Element::U32(42));
    /// let tags = ElementFactory::create("set_u32", Some("3,1,2")).unwrap();
    /// assert_eq!(tags.str(), "1,2,3");
    /// ```
    pub fn create(type_name: &str, value: Option<&str>) -> Result<Element, ElementError> {
        if let Some(member) = Self::set_member(type_name) {
            return Self::create_set(member, value);
        }

        let elem_type = Self::scalar_type(type_name)?;
        match value {
            Some(v) => Self::parse_scalar(elem_type, v),
            None => Self::default_scalar(elem_type),
        }
    }

    fn scalar_type(type_name: &str) -> Result<ElemType, ElementError> {
        let elem_type = match type_name {
            "null" => ElemType::Null,
            "bool" => ElemType::Bool,
            "u32" => ElemType::U32,
            "i32" => ElemType::I32,
            "txt" => ElemType::Str,
            "ipv4" => ElemType::Ipv4,
            "ipv6" => ElemType::Ipv6,
            "ipv4net" => ElemType::Ipv4Net,
            "ipv6net" => ElemType::Ipv6Net,
            "filter" => return Err(ElementError::NotCreatable("filter")),
            other => return Err(ElementError::UnknownType(other.to_string())),
        };
        Ok(elem_type)
    }

    fn set_member(type_name: &str) -> Option<ElemType> {
        match type_name {
            "set" => Some(ElemType::Str),
            "set_u32" => Some(ElemType::U32),
            "set_i32" => Some(ElemType::I32),
            "set_ipv4" => Some(ElemType::Ipv4),
            "set_ipv6" => Some(ElemType::Ipv6),
            "set_ipv4net" => Some(ElemType::Ipv4Net),
            "set_ipv6net" => Some(ElemType::Ipv6Net),
            _ => None,
        }
    }

    fn create_set(member: ElemType, value: Option<&str>) -> Result<Element, ElementError> {
        let mut elements = Vec::new();
        if let Some(v) = value {
            for token in v.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                elements.push(Self::parse_scalar(member, token)?);
            }
        }
        Ok(Element::Set(ElemSet::from_elements(member, elements)?))
    }

    fn default_scalar(elem_type: ElemType) -> Result<Element, ElementError> {
        let e = match elem_type {
            ElemType::Null => Element::Null,
            ElemType::Bool => Element::Bool(false),
            ElemType::U32 => Element::U32(0),
            ElemType::I32 => Element::I32(0),
            ElemType::Str => Element::text(""),
            ElemType::Ipv4 => Element::Ipv4(Ipv4Addr::UNSPECIFIED),
            ElemType::Ipv6 => Element::Ipv6(Ipv6Addr::UNSPECIFIED),
            ElemType::Ipv4Net => Element::Ipv4Net(Self::parse(ElemType::Ipv4Net, "0.0.0.0/0")?),
            ElemType::Ipv6Net => Element::Ipv6Net(Self::parse(ElemType::Ipv6Net, "::/0")?),
            ElemType::Set | ElemType::Filter => {
                return Err(ElementError::NotCreatable(elem_type.name()))
            }
        };
        Ok(e)
    }

    fn parse_scalar(elem_type: ElemType, value: &str) -> Result<Element, ElementError> {
        let e = match elem_type {
            ElemType::Null => Element::Null,
            ElemType::Bool => match value {
                "true" => Element::Bool(true),
                "false" => Element::Bool(false),
                _ => {
                    return Err(ElementError::Parse {
                        type_name: "bool",
                        value: value.to_string(),
                        reason: "expected true or false".to_string(),
                    })
                }
            },
            ElemType::U32 => Element::U32(Self::parse(elem_type, value)?),
            ElemType::I32 => Element::I32(Self::parse(elem_type, value)?),
            ElemType::Str => Element::text(value),
            ElemType::Ipv4 => Element::Ipv4(Self::parse(elem_type, value)?),
            ElemType::Ipv6 => Element::Ipv6(Self::parse(elem_type, value)?),
            ElemType::Ipv4Net => Element::Ipv4Net(Self::parse(elem_type, value)?),
            ElemType::Ipv6Net => Element::Ipv6Net(Self::parse(elem_type, value)?),
            ElemType::Set | ElemType::Filter => {
                return Err(ElementError::NotCreatable(elem_type.name()))
            }
        };
        Ok(e)
    }

    fn parse<T>(elem_type: ElemType, value: &str) -> Result<T, ElementError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value.trim().parse::<T>().map_err(|e| ElementError::Parse {
            type_name: elem_type.name(),
            value: value.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_scalars() {
        assert_eq!(ElementFactory::create("bool", Some("true")).unwrap(), Element::Bool(true));
        assert_eq!(ElementFactory::create("i32", Some("-4")).unwrap(), Element::I32(-4));
        assert_eq!(ElementFactory::create("txt", Some("hello")).unwrap(), Element::from("hello"));
        assert_eq!(
            ElementFactory::create("ipv4net", Some("192.168.1.7/24")).unwrap().str(),
            "192.168.1.0/24"
        );
        assert_eq!(
            ElementFactory::create("ipv6", Some("2001:db8::1")).unwrap().type_name(),
            "ipv6"
        );
    }

    #[test]
    fn missing_value_gives_default() {
        assert_eq!(ElementFactory::create("u32", None).unwrap(), Element::U32(0));
        let empty = ElementFactory::create("set_ipv4net", None).unwrap();
        assert_eq!(empty.type_name(), "set_ipv4net");
        assert!(empty.as_set().unwrap().is_empty());
    }

    #[test]
    fn creates_sets_from_comma_lists() {
        let set = ElementFactory::create("set", Some("b, a ,c")).unwrap();
        assert_eq!(set.str(), "a,b,c");
        assert_eq!(set.type_name(), "set");
    }

    #[test]
    fn reports_bad_input() {
        assert!(matches!(
            ElementFactory::create("u32", Some("-1")),
            Err(ElementError::Parse { type_name: "u32", .. })
        ));
        assert!(matches!(
            ElementFactory::create("set_u32", Some("1,x")),
            Err(ElementError::Parse { .. })
        ));
        assert!(matches!(
            ElementFactory::create("aspath", None),
            Err(ElementError::UnknownType(_))
        ));
        assert!(matches!(
            ElementFactory::create("filter", None),
            Err(ElementError::NotCreatable("filter"))
        ));
        assert!(ElementFactory::can_create("set_ipv6net"));
        assert!(!ElementFactory::can_create("filter"));
    }
}
