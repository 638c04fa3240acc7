//! The XML Schema datatypes library.
//!
//! Compilation turns a `data` element's type name and `param` facets into
//! an [`XsdDatatypes`] value, and a `value` element's body into an
//! [`XsdDatatypeValues`] constant. Lexical checks lean on a static regex
//! table; the numeric family parses through `num-bigint`/`bigdecimal` so
//! facet bounds compare by value, not lexically.

use super::{Datatype, DatatypeError, Namespaces, Param};
use crate::datatype::relax::normalize_whitespace;
use lazy_static::lazy_static;
use std::fmt;
use std::str::FromStr;

pub const NAMESPACE_URI: &str = "http://www.w3.org/2001/XMLSchema-datatypes";

lazy_static! {
    static ref LANG_RE: regex::Regex =
        regex::Regex::new(r"^[a-zA-Z]{1,8}(-[a-zA-Z0-9]{1,8})*$").unwrap();
    static ref DATETIME_RE: regex::Regex = regex::Regex::new(
        r"^-?\d{4,}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?$"
    )
    .unwrap();
    static ref DURATION_RE: regex::Regex = regex::Regex::new(
        r"^-?P(\d+Y)?(\d+M)?(\d+D)?(T(\d+H)?(\d+M)?(\d+(\.\d+)?S)?)?$"
    )
    .unwrap();
    static ref TIME_RE: regex::Regex =
        regex::Regex::new(r"^\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?$").unwrap();
    static ref GYEAR_RE: regex::Regex =
        regex::Regex::new(r"^-?\d{4,}(Z|[+-]\d{2}:\d{2})?$").unwrap();
    static ref GYEARMONTH_RE: regex::Regex =
        regex::Regex::new(r"^-?\d{4,}-\d{2}(Z|[+-]\d{2}:\d{2})?$").unwrap();
    static ref GMONTH_RE: regex::Regex =
        regex::Regex::new(r"^--\d{2}(Z|[+-]\d{2}:\d{2})?$").unwrap();
    static ref GMONTHDAY_RE: regex::Regex =
        regex::Regex::new(r"^--\d{2}-\d{2}(Z|[+-]\d{2}:\d{2})?$").unwrap();
    static ref GDAY_RE: regex::Regex =
        regex::Regex::new(r"^---\d{2}(Z|[+-]\d{2}:\d{2})?$").unwrap();
    static ref BASE64_RE: regex::Regex =
        regex::Regex::new(r"^[A-Za-z0-9+/\s]*={0,2}$").unwrap();
    static ref HEXBINARY_RE: regex::Regex = regex::Regex::new(r"^([0-9A-Fa-f]{2})*$").unwrap();
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum XsdDatatypes {
    String(StringFacets),
    NormalizedString(StringFacets),
    Token(LengthFacet),
    Language(Option<PatternFacet>),
    Name(LengthFacet),
    NcName(LengthFacet),
    NmToken(LengthFacet),
    NmTokens(LengthFacet),
    Id(Option<PatternFacet>),
    IdRef(Option<PatternFacet>),
    Entity(LengthFacet),
    Byte(MinMaxFacet<i8>, Option<PatternFacet>),
    Short(MinMaxFacet<i16>, Option<PatternFacet>),
    Int(MinMaxFacet<i32>, Option<PatternFacet>),
    Long(MinMaxFacet<i64>, Option<PatternFacet>),
    UnsignedByte(MinMaxFacet<u8>, Option<PatternFacet>),
    UnsignedShort(MinMaxFacet<u16>, Option<PatternFacet>),
    UnsignedInt(MinMaxFacet<u32>, Option<PatternFacet>),
    UnsignedLong(MinMaxFacet<u64>, Option<PatternFacet>),
    Integer(MinMaxFacet<num_bigint::BigInt>, Option<PatternFacet>),
    PositiveInteger(MinMaxFacet<num_bigint::BigUint>, Option<PatternFacet>),
    NonNegativeInteger(MinMaxFacet<num_bigint::BigUint>, Option<PatternFacet>),
    NegativeInteger(MinMaxFacet<num_bigint::BigInt>, Option<PatternFacet>),
    NonPositiveInteger(MinMaxFacet<num_bigint::BigInt>, Option<PatternFacet>),
    Decimal {
        min_max: MinMaxFacet<bigdecimal::BigDecimal>,
        pattern: Option<PatternFacet>,
        fraction_digits: Option<u16>,
        total_digits: Option<u16>,
    },
    Float(Option<PatternFacet>),
    Double(Option<PatternFacet>),
    Boolean(Option<PatternFacet>),
    Duration(Option<PatternFacet>),
    Date(Option<PatternFacet>),
    Datetime(Option<PatternFacet>),
    Time(Option<PatternFacet>),
    GYear(Option<PatternFacet>),
    GYearMonth(Option<PatternFacet>),
    GMonth(Option<PatternFacet>),
    GMonthDay(Option<PatternFacet>),
    GDay(Option<PatternFacet>),
    AnyUri(Option<PatternFacet>),
    Base64Binary(LengthFacet),
    HexBinary(LengthFacet),
    QName,
    Notation,
}

fn patt_ok(pattern: &Option<PatternFacet>, value: &str) -> bool {
    pattern.as_ref().map(|p| p.is_valid(value)).unwrap_or(true)
}

fn int_ok<T>(min_max: &MinMaxFacet<T>, pattern: &Option<PatternFacet>, value: &str) -> bool
where
    T: FromStr + PartialOrd,
{
    T::from_str(value)
        .ok()
        .map(|v| min_max.is_valid(&v))
        .unwrap_or(false)
        && patt_ok(pattern, value)
}

impl Datatype for XsdDatatypes {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            XsdDatatypes::String(facets) => facets.is_valid(value),
            XsdDatatypes::NormalizedString(facets) => {
                facets.is_valid(&normalize_whitespace(value))
            }
            XsdDatatypes::Token(len) => {
                normalize_whitespace(value) == value && len.is_valid(value)
            }
            XsdDatatypes::Language(patt) => LANG_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::Name(len) => is_valid_name(value) && len.is_valid(value),
            XsdDatatypes::NcName(len) => is_valid_ncname(value) && len.is_valid(value),
            XsdDatatypes::NmToken(len) => is_valid_nmtoken(value) && len.is_valid(value),
            XsdDatatypes::NmTokens(len) => {
                let tokens: Vec<&str> = value.split_ascii_whitespace().collect();
                // length facets on NMTOKENS count tokens, not characters
                !tokens.is_empty()
                    && tokens.iter().all(|t| is_valid_nmtoken(t))
                    && len.check(tokens.len())
            }
            XsdDatatypes::Id(patt) | XsdDatatypes::IdRef(patt) => {
                is_valid_ncname(value) && patt_ok(patt, value)
            }
            XsdDatatypes::Entity(len) => is_valid_ncname(value) && len.is_valid(value),
            XsdDatatypes::Byte(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::Short(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::Int(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::Long(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::UnsignedByte(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::UnsignedShort(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::UnsignedInt(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::UnsignedLong(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::Integer(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::PositiveInteger(mm, patt) => {
                num_bigint::BigUint::from_str(value)
                    .ok()
                    .map(|v| v >= num_bigint::BigUint::from(1u32) && mm.is_valid(&v))
                    .unwrap_or(false)
                    && patt_ok(patt, value)
            }
            XsdDatatypes::NonNegativeInteger(mm, patt) => int_ok(mm, patt, value),
            XsdDatatypes::NegativeInteger(mm, patt) => {
                num_bigint::BigInt::from_str(value)
                    .ok()
                    .map(|v| v <= num_bigint::BigInt::from(-1) && mm.is_valid(&v))
                    .unwrap_or(false)
                    && patt_ok(patt, value)
            }
            XsdDatatypes::NonPositiveInteger(mm, patt) => {
                num_bigint::BigInt::from_str(value)
                    .ok()
                    .map(|v| v <= num_bigint::BigInt::from(0) && mm.is_valid(&v))
                    .unwrap_or(false)
                    && patt_ok(patt, value)
            }
            XsdDatatypes::Decimal {
                min_max,
                pattern,
                fraction_digits,
                total_digits,
            } => {
                bigdecimal::BigDecimal::from_str(value)
                    .ok()
                    .map(|v| min_max.is_valid(&v))
                    .unwrap_or(false)
                    && patt_ok(pattern, value)
                    && digits_ok(value, *fraction_digits, *total_digits)
            }
            XsdDatatypes::Float(patt) => value.parse::<f32>().is_ok() && patt_ok(patt, value),
            XsdDatatypes::Double(patt) => value.parse::<f64>().is_ok() && patt_ok(patt, value),
            XsdDatatypes::Boolean(patt) => {
                matches!(value, "true" | "false" | "1" | "0") && patt_ok(patt, value)
            }
            XsdDatatypes::Duration(patt) => {
                DURATION_RE.is_match(value) && value != "P" && value != "-P" && patt_ok(patt, value)
            }
            XsdDatatypes::Date(patt) => {
                chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
                    && patt_ok(patt, value)
            }
            XsdDatatypes::Datetime(patt) => DATETIME_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::Time(patt) => TIME_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::GYear(patt) => GYEAR_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::GYearMonth(patt) => GYEARMONTH_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::GMonth(patt) => GMONTH_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::GMonthDay(patt) => GMONTHDAY_RE.is_match(value) && patt_ok(patt, value),
            XsdDatatypes::GDay(patt) => GDAY_RE.is_match(value) && patt_ok(patt, value),
            // anyURI accepts any string (XSD 1.0 practice)
            XsdDatatypes::AnyUri(patt) => patt_ok(patt, value),
            XsdDatatypes::Base64Binary(len) => {
                BASE64_RE.is_match(value) && {
                    // length facets count decoded octets
                    let stripped: usize =
                        value.chars().filter(|c| !c.is_ascii_whitespace()).count();
                    let pad = value.chars().rev().take_while(|&c| c == '=').count();
                    let octets = if stripped == 0 { 0 } else { stripped * 3 / 4 - pad };
                    len.check(octets)
                }
            }
            XsdDatatypes::HexBinary(len) => {
                HEXBINARY_RE.is_match(value) && len.check(value.len() / 2)
            }
            XsdDatatypes::QName | XsdDatatypes::Notation => is_valid_qname_syntax(value),
        }
    }
}

impl XsdDatatypes {
    pub fn is_valid(&self, value: &str) -> bool {
        Datatype::is_valid(self, value)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            XsdDatatypes::String(_) => "string",
            XsdDatatypes::NormalizedString(_) => "normalizedString",
            XsdDatatypes::Token(_) => "token",
            XsdDatatypes::Language(_) => "language",
            XsdDatatypes::Name(_) => "Name",
            XsdDatatypes::NcName(_) => "NCName",
            XsdDatatypes::NmToken(_) => "NMTOKEN",
            XsdDatatypes::NmTokens(_) => "NMTOKENS",
            XsdDatatypes::Id(_) => "ID",
            XsdDatatypes::IdRef(_) => "IDREF",
            XsdDatatypes::Entity(_) => "ENTITY",
            XsdDatatypes::Byte(_, _) => "byte",
            XsdDatatypes::Short(_, _) => "short",
            XsdDatatypes::Int(_, _) => "int",
            XsdDatatypes::Long(_, _) => "long",
            XsdDatatypes::UnsignedByte(_, _) => "unsignedByte",
            XsdDatatypes::UnsignedShort(_, _) => "unsignedShort",
            XsdDatatypes::UnsignedInt(_, _) => "unsignedInt",
            XsdDatatypes::UnsignedLong(_, _) => "unsignedLong",
            XsdDatatypes::Integer(_, _) => "integer",
            XsdDatatypes::PositiveInteger(_, _) => "positiveInteger",
            XsdDatatypes::NonNegativeInteger(_, _) => "nonNegativeInteger",
            XsdDatatypes::NegativeInteger(_, _) => "negativeInteger",
            XsdDatatypes::NonPositiveInteger(_, _) => "nonPositiveInteger",
            XsdDatatypes::Decimal { .. } => "decimal",
            XsdDatatypes::Float(_) => "float",
            XsdDatatypes::Double(_) => "double",
            XsdDatatypes::Boolean(_) => "boolean",
            XsdDatatypes::Duration(_) => "duration",
            XsdDatatypes::Date(_) => "date",
            XsdDatatypes::Datetime(_) => "dateTime",
            XsdDatatypes::Time(_) => "time",
            XsdDatatypes::GYear(_) => "gYear",
            XsdDatatypes::GYearMonth(_) => "gYearMonth",
            XsdDatatypes::GMonth(_) => "gMonth",
            XsdDatatypes::GMonthDay(_) => "gMonthDay",
            XsdDatatypes::GDay(_) => "gDay",
            XsdDatatypes::AnyUri(_) => "anyURI",
            XsdDatatypes::Base64Binary(_) => "base64Binary",
            XsdDatatypes::HexBinary(_) => "hexBinary",
            XsdDatatypes::QName => "QName",
            XsdDatatypes::Notation => "NOTATION",
        }
    }

    pub fn lexical_pattern(&self) -> Option<&'static regex::Regex> {
        match self {
            XsdDatatypes::Language(_) => Some(&LANG_RE),
            XsdDatatypes::Duration(_) => Some(&DURATION_RE),
            XsdDatatypes::Datetime(_) => Some(&DATETIME_RE),
            XsdDatatypes::Time(_) => Some(&TIME_RE),
            XsdDatatypes::GYear(_) => Some(&GYEAR_RE),
            XsdDatatypes::GYearMonth(_) => Some(&GYEARMONTH_RE),
            XsdDatatypes::GMonth(_) => Some(&GMONTH_RE),
            XsdDatatypes::GMonthDay(_) => Some(&GMONTHDAY_RE),
            XsdDatatypes::GDay(_) => Some(&GDAY_RE),
            XsdDatatypes::Base64Binary(_) => Some(&BASE64_RE),
            XsdDatatypes::HexBinary(_) => Some(&HEXBINARY_RE),
            _ => None,
        }
    }
}

/// totalDigits / fractionDigits checks, applied to the lexical form.
fn digits_ok(value: &str, fraction_digits: Option<u16>, total_digits: Option<u16>) -> bool {
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    let fraction = match value.find('.') {
        Some(pos) => value[pos + 1..].chars().filter(|c| c.is_ascii_digit()).count(),
        None => 0,
    };
    total_digits.map(|t| digits <= t as usize).unwrap_or(true)
        && fraction_digits
            .map(|fd| fraction <= fd as usize)
            .unwrap_or(true)
}

// --- Lexical helpers for the XML name family ---

pub fn is_nc_name_start_char(c: char) -> bool {
    matches!(c, 'A'..='Z' | 'a'..='z' | '_')
        || ('\u{C0}'..='\u{D6}').contains(&c)
        || ('\u{D8}'..='\u{F6}').contains(&c)
        || ('\u{F8}'..='\u{2FF}').contains(&c)
        || ('\u{370}'..='\u{37D}').contains(&c)
        || ('\u{37F}'..='\u{1FFF}').contains(&c)
        || ('\u{200C}'..='\u{200D}').contains(&c)
        || ('\u{2070}'..='\u{218F}').contains(&c)
        || ('\u{2C00}'..='\u{2FEF}').contains(&c)
        || ('\u{3001}'..='\u{D7FF}').contains(&c)
        || ('\u{F900}'..='\u{FDCF}').contains(&c)
        || ('\u{FDF0}'..='\u{FFFD}').contains(&c)
        || ('\u{10000}'..='\u{EFFFF}').contains(&c)
}

pub fn is_nc_name_char(c: char) -> bool {
    is_nc_name_start_char(c)
        || matches!(c, '-' | '.' | '0'..='9' | '\u{B7}')
        || ('\u{300}'..='\u{36F}').contains(&c)
        || ('\u{203F}'..='\u{2040}').contains(&c)
}

pub fn is_valid_ncname(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        None => false,
        Some(first) => is_nc_name_start_char(first) && chars.all(is_nc_name_char),
    }
}

fn is_name_char(c: char) -> bool {
    c == ':' || is_nc_name_char(c)
}

fn is_valid_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        None => false,
        Some(first) => (first == ':' || is_nc_name_start_char(first)) && chars.all(is_name_char),
    }
}

fn is_valid_nmtoken(text: &str) -> bool {
    !text.is_empty() && text.chars().all(is_name_char)
}

fn is_valid_qname_syntax(text: &str) -> bool {
    match text.find(':') {
        Some(pos) => {
            is_valid_ncname(&text[..pos]) && is_valid_ncname(&text[pos + 1..])
        }
        None => is_valid_ncname(text),
    }
}

// --- Facets ---

#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct LengthFacet {
    exact: Option<usize>,
    min: Option<usize>,
    max: Option<usize>,
}

impl LengthFacet {
    fn set_length(&mut self, n: usize) -> Result<(), String> {
        if self.exact.is_some() || self.min.is_some() || self.max.is_some() {
            return Err("length conflicts with another length facet".to_string());
        }
        self.exact = Some(n);
        Ok(())
    }

    fn set_min_length(&mut self, n: usize) -> Result<(), String> {
        if self.exact.is_some() || self.min.is_some() {
            return Err("minLength given twice or conflicts with length".to_string());
        }
        if self.max.map(|max| n > max).unwrap_or(false) {
            return Err("minLength greater than maxLength".to_string());
        }
        self.min = Some(n);
        Ok(())
    }

    fn set_max_length(&mut self, n: usize) -> Result<(), String> {
        if self.exact.is_some() || self.max.is_some() {
            return Err("maxLength given twice or conflicts with length".to_string());
        }
        if self.min.map(|min| n < min).unwrap_or(false) {
            return Err("maxLength smaller than minLength".to_string());
        }
        self.max = Some(n);
        Ok(())
    }

    /// Check a unit count (characters, tokens, or octets depending on type).
    pub fn check(&self, actual: usize) -> bool {
        if let Some(exact) = self.exact {
            return actual == exact;
        }
        self.min.map(|min| actual >= min).unwrap_or(true)
            && self.max.map(|max| actual <= max).unwrap_or(true)
    }

    pub fn is_valid(&self, value: &str) -> bool {
        self.check(value.chars().count())
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum Bound<T> {
    Inclusive(T),
    Exclusive(T),
}

impl<T: PartialOrd> Bound<T> {
    fn admits_below(&self, v: &T) -> bool {
        match self {
            Bound::Inclusive(max) => v <= max,
            Bound::Exclusive(max) => v < max,
        }
    }

    fn admits_above(&self, v: &T) -> bool {
        match self {
            Bound::Inclusive(min) => v >= min,
            Bound::Exclusive(min) => v > min,
        }
    }

    fn value(&self) -> &T {
        match self {
            Bound::Inclusive(v) | Bound::Exclusive(v) => v,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MinMaxFacet<T> {
    min: Option<Bound<T>>,
    max: Option<Bound<T>>,
}

impl<T> Default for MinMaxFacet<T> {
    fn default() -> Self {
        MinMaxFacet {
            min: None,
            max: None,
        }
    }
}

impl<T: PartialOrd> MinMaxFacet<T> {
    fn set_min(&mut self, bound: Bound<T>) -> Result<(), String> {
        if self.min.is_some() {
            return Err("conflicting lower-bound facets".to_string());
        }
        if let Some(max) = &self.max {
            if bound.value() > max.value() {
                return Err("lower bound exceeds upper bound".to_string());
            }
        }
        self.min = Some(bound);
        Ok(())
    }

    fn set_max(&mut self, bound: Bound<T>) -> Result<(), String> {
        if self.max.is_some() {
            return Err("conflicting upper-bound facets".to_string());
        }
        if let Some(min) = &self.min {
            if bound.value() < min.value() {
                return Err("upper bound below lower bound".to_string());
            }
        }
        self.max = Some(bound);
        Ok(())
    }

    pub fn is_valid(&self, v: &T) -> bool {
        self.min.as_ref().map(|b| b.admits_above(v)).unwrap_or(true)
            && self.max.as_ref().map(|b| b.admits_below(v)).unwrap_or(true)
    }

    pub fn bounded(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }
}

#[derive(Clone)]
pub struct PatternFacet(String, regex::Regex);

impl PatternFacet {
    fn new(path: &str, type_name: &str, source: &str) -> Result<PatternFacet, DatatypeError> {
        // Patterns match the whole value.
        let re = regex::Regex::new(&format!("^(?:{})$", source)).map_err(|e| {
            DatatypeError::Parameter {
                path: path.to_string(),
                type_name: type_name.to_string(),
                detail: format!("bad pattern: {}", e),
            }
        })?;
        Ok(PatternFacet(source.to_string(), re))
    }

    fn is_valid(&self, value: &str) -> bool {
        self.1.is_match(value)
    }
}

impl PartialEq for PatternFacet {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for PatternFacet {}
impl std::hash::Hash for PatternFacet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}
impl fmt::Debug for PatternFacet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("PatternFacet").field(&self.0).finish()
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StringFacets {
    len: LengthFacet,
    pattern: Option<PatternFacet>,
}

impl StringFacets {
    fn is_valid(&self, value: &str) -> bool {
        self.len.is_valid(value) && patt_ok(&self.pattern, value)
    }
}

// --- Facet parsing ---

fn param_err(path: &str, type_name: &str, detail: String) -> DatatypeError {
    DatatypeError::Parameter {
        path: path.to_string(),
        type_name: type_name.to_string(),
        detail,
    }
}

fn parse_num<T: FromStr>(path: &str, type_name: &str, param: &Param) -> Result<T, DatatypeError> {
    T::from_str(param.value.trim()).map_err(|_| {
        param_err(
            path,
            type_name,
            format!("{} is not a valid {} facet value", param.value, param.name),
        )
    })
}

fn min_max_type<T>(
    path: &str,
    type_name: &str,
    params: &[Param],
    ctor: impl FnOnce(MinMaxFacet<T>, Option<PatternFacet>) -> XsdDatatypes,
) -> Result<XsdDatatypes, DatatypeError>
where
    T: FromStr + PartialOrd,
{
    let mut min_max = MinMaxFacet::default();
    let mut pattern = None;
    for param in params {
        let set = match param.name.as_str() {
            "minInclusive" => min_max.set_min(Bound::Inclusive(parse_num(path, type_name, param)?)),
            "minExclusive" => min_max.set_min(Bound::Exclusive(parse_num(path, type_name, param)?)),
            "maxInclusive" => min_max.set_max(Bound::Inclusive(parse_num(path, type_name, param)?)),
            "maxExclusive" => min_max.set_max(Bound::Exclusive(parse_num(path, type_name, param)?)),
            "pattern" => {
                pattern = Some(PatternFacet::new(path, type_name, &param.value)?);
                Ok(())
            }
            other => {
                return Err(param_err(
                    path,
                    type_name,
                    format!("unsupported facet {:?}", other),
                ))
            }
        };
        set.map_err(|detail| param_err(path, type_name, detail))?;
    }
    Ok(ctor(min_max, pattern))
}

fn length_params(
    path: &str,
    type_name: &str,
    params: &[Param],
) -> Result<LengthFacet, DatatypeError> {
    let mut len = LengthFacet::default();
    for param in params {
        let set = match param.name.as_str() {
            "length" => len.set_length(parse_num(path, type_name, param)?),
            "minLength" => len.set_min_length(parse_num(path, type_name, param)?),
            "maxLength" => len.set_max_length(parse_num(path, type_name, param)?),
            other => {
                return Err(param_err(
                    path,
                    type_name,
                    format!("unsupported facet {:?}", other),
                ))
            }
        };
        set.map_err(|detail| param_err(path, type_name, detail))?;
    }
    Ok(len)
}

fn length_type(
    path: &str,
    type_name: &str,
    params: &[Param],
    ctor: impl FnOnce(LengthFacet) -> XsdDatatypes,
) -> Result<XsdDatatypes, DatatypeError> {
    length_params(path, type_name, params).map(ctor)
}

fn pattern_type(
    path: &str,
    type_name: &str,
    params: &[Param],
    ctor: impl FnOnce(Option<PatternFacet>) -> XsdDatatypes,
) -> Result<XsdDatatypes, DatatypeError> {
    let mut pattern = None;
    for param in params {
        match param.name.as_str() {
            "pattern" => pattern = Some(PatternFacet::new(path, type_name, &param.value)?),
            other => {
                return Err(param_err(
                    path,
                    type_name,
                    format!("unsupported facet {:?}", other),
                ))
            }
        }
    }
    Ok(ctor(pattern))
}

fn string_type(
    path: &str,
    type_name: &str,
    params: &[Param],
    ctor: impl FnOnce(StringFacets) -> XsdDatatypes,
) -> Result<XsdDatatypes, DatatypeError> {
    let mut len = LengthFacet::default();
    let mut pattern = None;
    for param in params {
        let set = match param.name.as_str() {
            "length" => len.set_length(parse_num(path, type_name, param)?),
            "minLength" => len.set_min_length(parse_num(path, type_name, param)?),
            "maxLength" => len.set_max_length(parse_num(path, type_name, param)?),
            "pattern" => {
                pattern = Some(PatternFacet::new(path, type_name, &param.value)?);
                Ok(())
            }
            other => {
                return Err(param_err(
                    path,
                    type_name,
                    format!("unsupported facet {:?}", other),
                ))
            }
        };
        set.map_err(|detail| param_err(path, type_name, detail))?;
    }
    Ok(ctor(StringFacets { len, pattern }))
}

fn decimal_type(path: &str, params: &[Param]) -> Result<XsdDatatypes, DatatypeError> {
    let mut min_max = MinMaxFacet::default();
    let mut pattern = None;
    let mut fraction_digits = None;
    let mut total_digits = None;
    for param in params {
        let set = match param.name.as_str() {
            "minInclusive" => min_max.set_min(Bound::Inclusive(parse_num(path, "decimal", param)?)),
            "minExclusive" => min_max.set_min(Bound::Exclusive(parse_num(path, "decimal", param)?)),
            "maxInclusive" => min_max.set_max(Bound::Inclusive(parse_num(path, "decimal", param)?)),
            "maxExclusive" => min_max.set_max(Bound::Exclusive(parse_num(path, "decimal", param)?)),
            "pattern" => {
                pattern = Some(PatternFacet::new(path, "decimal", &param.value)?);
                Ok(())
            }
            "fractionDigits" => {
                fraction_digits = Some(parse_num(path, "decimal", param)?);
                Ok(())
            }
            "totalDigits" => {
                total_digits = Some(parse_num(path, "decimal", param)?);
                Ok(())
            }
            other => {
                return Err(param_err(
                    path,
                    "decimal",
                    format!("unsupported facet {:?}", other),
                ))
            }
        };
        set.map_err(|detail| param_err(path, "decimal", detail))?;
    }
    Ok(XsdDatatypes::Decimal {
        min_max,
        pattern,
        fraction_digits,
        total_digits,
    })
}

fn no_params(path: &str, type_name: &str, params: &[Param]) -> Result<(), DatatypeError> {
    match params.first() {
        Some(param) => Err(param_err(
            path,
            type_name,
            format!("{} does not support facets ({:?})", type_name, param.name),
        )),
        None => Ok(()),
    }
}

pub fn compile(path: &str, name: &str, params: &[Param]) -> Result<XsdDatatypes, DatatypeError> {
    match name {
        "string" => string_type(path, name, params, XsdDatatypes::String),
        "normalizedString" => string_type(path, name, params, XsdDatatypes::NormalizedString),
        "token" => length_type(path, name, params, XsdDatatypes::Token),
        "language" => pattern_type(path, name, params, XsdDatatypes::Language),
        "Name" => length_type(path, name, params, XsdDatatypes::Name),
        "NCName" => length_type(path, name, params, XsdDatatypes::NcName),
        "NMTOKEN" => length_type(path, name, params, XsdDatatypes::NmToken),
        "NMTOKENS" => length_type(path, name, params, XsdDatatypes::NmTokens),
        "ID" => pattern_type(path, name, params, XsdDatatypes::Id),
        "IDREF" => pattern_type(path, name, params, XsdDatatypes::IdRef),
        "ENTITY" | "ENTITIES" => length_type(path, name, params, XsdDatatypes::Entity),
        "byte" => min_max_type::<i8>(path, name, params, XsdDatatypes::Byte),
        "short" => min_max_type::<i16>(path, name, params, XsdDatatypes::Short),
        "int" => min_max_type::<i32>(path, name, params, XsdDatatypes::Int),
        "long" => min_max_type::<i64>(path, name, params, XsdDatatypes::Long),
        "unsignedByte" => min_max_type::<u8>(path, name, params, XsdDatatypes::UnsignedByte),
        "unsignedShort" => min_max_type::<u16>(path, name, params, XsdDatatypes::UnsignedShort),
        "unsignedInt" => min_max_type::<u32>(path, name, params, XsdDatatypes::UnsignedInt),
        "unsignedLong" => min_max_type::<u64>(path, name, params, XsdDatatypes::UnsignedLong),
        "integer" => min_max_type::<num_bigint::BigInt>(path, name, params, XsdDatatypes::Integer),
        "positiveInteger" => {
            min_max_type::<num_bigint::BigUint>(path, name, params, XsdDatatypes::PositiveInteger)
        }
        "nonNegativeInteger" => min_max_type::<num_bigint::BigUint>(
            path,
            name,
            params,
            XsdDatatypes::NonNegativeInteger,
        ),
        "negativeInteger" => {
            min_max_type::<num_bigint::BigInt>(path, name, params, XsdDatatypes::NegativeInteger)
        }
        "nonPositiveInteger" => min_max_type::<num_bigint::BigInt>(
            path,
            name,
            params,
            XsdDatatypes::NonPositiveInteger,
        ),
        "decimal" => decimal_type(path, params),
        "float" => pattern_type(path, name, params, XsdDatatypes::Float),
        "double" => pattern_type(path, name, params, XsdDatatypes::Double),
        "boolean" => pattern_type(path, name, params, XsdDatatypes::Boolean),
        "duration" => pattern_type(path, name, params, XsdDatatypes::Duration),
        "date" => pattern_type(path, name, params, XsdDatatypes::Date),
        "dateTime" => pattern_type(path, name, params, XsdDatatypes::Datetime),
        "time" => pattern_type(path, name, params, XsdDatatypes::Time),
        "gYear" => pattern_type(path, name, params, XsdDatatypes::GYear),
        "gYearMonth" => pattern_type(path, name, params, XsdDatatypes::GYearMonth),
        "gMonth" => pattern_type(path, name, params, XsdDatatypes::GMonth),
        "gMonthDay" => pattern_type(path, name, params, XsdDatatypes::GMonthDay),
        "gDay" => pattern_type(path, name, params, XsdDatatypes::GDay),
        "anyURI" => pattern_type(path, name, params, XsdDatatypes::AnyUri),
        "QName" => {
            no_params(path, name, params)?;
            Ok(XsdDatatypes::QName)
        }
        "NOTATION" => {
            no_params(path, name, params)?;
            Ok(XsdDatatypes::Notation)
        }
        _ => Err(DatatypeError::UnknownDatatype {
            path: path.to_string(),
            library: NAMESPACE_URI.to_string(),
            name: name.to_string(),
        }),
    }
}

// --- Typed value constants ---

/// A resolved QName value: expanded namespace plus local name.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct QNameVal {
    pub namespace_uri: String,
    pub local_name: String,
}

impl QNameVal {
    /// Resolve a lexical QName against in-scope bindings. Unprefixed names
    /// resolve through the default namespace.
    pub fn from_value(value: &str, ns: &dyn Namespaces) -> Result<QNameVal, String> {
        let value = normalize_whitespace(value);
        let (prefix, local) = match value.find(':') {
            Some(pos) => {
                let (prefix, rest) = value.split_at(pos);
                let local = &rest[1..];
                if local.contains(':') {
                    return Err(format!("{:?} has more than one colon", value));
                }
                (prefix, local)
            }
            None => ("", &value[..]),
        };
        if !local.is_empty() && !is_valid_ncname(local) {
            return Err(format!("{:?} is not a valid QName", value));
        }
        if local.is_empty() {
            return Err(format!("{:?} is not a valid QName", value));
        }
        let namespace_uri = if prefix.is_empty() {
            ns.resolve("").unwrap_or("").to_string()
        } else {
            ns.resolve(prefix)
                .ok_or_else(|| format!("undefined namespace prefix {:?}", prefix))?
                .to_string()
        };
        Ok(QNameVal {
            namespace_uri,
            local_name: local.to_string(),
        })
    }
}

/// An f64 by bit pattern, so typed values stay hashable. Zeroes are
/// normalized so `0` and `-0` compare equal, as XSD requires.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct F64Bits(u64);

impl F64Bits {
    fn of(f: f64) -> F64Bits {
        let f = if f == 0.0 { 0.0 } else { f };
        F64Bits(f.to_bits())
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum XsdDatatypeValues {
    String(String),
    Token(String),
    QName(QNameVal),
    Notation(QNameVal),
    Integer(num_bigint::BigInt),
    Decimal(bigdecimal::BigDecimal),
    Double(F64Bits),
    Boolean(bool),
    /// Whitespace-collapsed lexical comparison, for types whose value space
    /// this library does not model.
    Lexical(String),
}

impl Datatype for XsdDatatypeValues {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            XsdDatatypeValues::String(s) => s == value,
            XsdDatatypeValues::Token(s) => *s == normalize_whitespace(value),
            // QName comparison needs namespace context; see is_valid_with_ns
            XsdDatatypeValues::QName(_) | XsdDatatypeValues::Notation(_) => false,
            XsdDatatypeValues::Integer(n) => {
                num_bigint::BigInt::from_str(value.trim()).map(|v| v == *n).unwrap_or(false)
            }
            XsdDatatypeValues::Decimal(n) => bigdecimal::BigDecimal::from_str(value.trim())
                .map(|v| v == *n)
                .unwrap_or(false),
            XsdDatatypeValues::Double(bits) => value
                .trim()
                .parse::<f64>()
                .map(|v| F64Bits::of(v) == *bits)
                .unwrap_or(false),
            XsdDatatypeValues::Boolean(b) => match value.trim() {
                "true" | "1" => *b,
                "false" | "0" => !*b,
                _ => false,
            },
            XsdDatatypeValues::Lexical(s) => *s == normalize_whitespace(value),
        }
    }
}

impl XsdDatatypeValues {
    pub fn is_valid(&self, value: &str) -> bool {
        Datatype::is_valid(self, value)
    }

    pub fn is_valid_with_ns(&self, value: &str, ns: &dyn Namespaces) -> bool {
        match self {
            XsdDatatypeValues::QName(expect) | XsdDatatypeValues::Notation(expect) => {
                QNameVal::from_value(value, ns)
                    .map(|got| got == *expect)
                    .unwrap_or(false)
            }
            _ => self.is_valid(value),
        }
    }
}

pub fn compile_value(
    path: &str,
    name: &str,
    value: &str,
    ns: &dyn Namespaces,
) -> Result<XsdDatatypeValues, DatatypeError> {
    let value_err = |detail: String| DatatypeError::Value {
        path: path.to_string(),
        type_name: name.to_string(),
        detail,
    };
    match name {
        "string" => Ok(XsdDatatypeValues::String(value.to_string())),
        "normalizedString" | "token" => {
            Ok(XsdDatatypeValues::Token(normalize_whitespace(value)))
        }
        "QName" => QNameVal::from_value(value, ns)
            .map(XsdDatatypeValues::QName)
            .map_err(value_err),
        "NOTATION" => QNameVal::from_value(value, ns)
            .map(XsdDatatypeValues::Notation)
            .map_err(value_err),
        "byte" | "short" | "int" | "long" | "integer" | "negativeInteger"
        | "nonPositiveInteger" => num_bigint::BigInt::from_str(value.trim())
            .map(XsdDatatypeValues::Integer)
            .map_err(|_| value_err(format!("{:?} is not an integer", value))),
        "unsignedByte" | "unsignedShort" | "unsignedInt" | "unsignedLong" | "positiveInteger"
        | "nonNegativeInteger" => num_bigint::BigUint::from_str(value.trim())
            .map(|v| XsdDatatypeValues::Integer(v.into()))
            .map_err(|_| value_err(format!("{:?} is not a non-negative integer", value))),
        "decimal" => bigdecimal::BigDecimal::from_str(value.trim())
            .map(XsdDatatypeValues::Decimal)
            .map_err(|_| value_err(format!("{:?} is not a decimal", value))),
        "float" | "double" => value
            .trim()
            .parse::<f64>()
            .map(|v| XsdDatatypeValues::Double(F64Bits::of(v)))
            .map_err(|_| value_err(format!("{:?} is not a floating point number", value))),
        "boolean" => match value.trim() {
            "true" | "1" => Ok(XsdDatatypeValues::Boolean(true)),
            "false" | "0" => Ok(XsdDatatypeValues::Boolean(false)),
            _ => Err(value_err(format!("{:?} is not a boolean", value))),
        },
        _ => {
            // Fall back to lexical comparison, but insist the body is at
            // least a valid literal of the type.
            let datatype = compile(path, name, &[])?;
            let collapsed = normalize_whitespace(value);
            if !datatype.is_valid(&collapsed) {
                return Err(value_err(format!(
                    "{:?} is not a valid {} literal",
                    value, name
                )));
            }
            Ok(XsdDatatypeValues::Lexical(collapsed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapNs(HashMap<String, String>);
    impl Namespaces for MapNs {
        fn resolve(&self, prefix: &str) -> Option<&str> {
            self.0.get(prefix).map(|s| &s[..])
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<Param> {
        pairs
            .iter()
            .map(|(n, v)| Param {
                name: n.to_string(),
                value: v.to_string(),
            })
            .collect()
    }

    #[test]
    fn short_bounds() {
        let dt = compile(
            "/data",
            "short",
            &params(&[("minInclusive", "1"), ("maxExclusive", "10")]),
        )
        .unwrap();
        assert!(dt.is_valid("1"));
        assert!(dt.is_valid("9"));
        assert!(!dt.is_valid("10"));
        assert!(!dt.is_valid("0"));
        assert!(!dt.is_valid("banana"));
    }

    #[test]
    fn conflicting_bounds_rejected() {
        let err = compile(
            "/data",
            "int",
            &params(&[("minInclusive", "5"), ("maxInclusive", "2")]),
        )
        .unwrap_err();
        assert!(matches!(err, DatatypeError::Parameter { .. }));
    }

    #[test]
    fn token_facets_count_characters() {
        let dt = compile("/data", "token", &params(&[("maxLength", "3")])).unwrap();
        assert!(dt.is_valid("abc"));
        assert!(!dt.is_valid("abcd"));
        // tokens may not carry stray whitespace
        assert!(!dt.is_valid(" ab"));
    }

    #[test]
    fn nmtokens_length_counts_tokens() {
        let dt = compile("/data", "NMTOKENS", &params(&[("length", "2")])).unwrap();
        assert!(dt.is_valid("alpha beta"));
        assert!(!dt.is_valid("alpha"));
    }

    #[test]
    fn pattern_is_anchored() {
        let dt = compile("/data", "string", &params(&[("pattern", "[a-z]{2}")])).unwrap();
        assert!(dt.is_valid("ab"));
        assert!(!dt.is_valid("abc"));
        assert!(!dt.is_valid("xabz"));
    }

    #[test]
    fn temporal_lexical_spaces() {
        assert!(compile("/d", "date", &[]).unwrap().is_valid("2021-02-03"));
        assert!(!compile("/d", "date", &[]).unwrap().is_valid("2021-02-30"));
        assert!(compile("/d", "duration", &[]).unwrap().is_valid("P1Y2M3DT4H5M6S"));
        assert!(!compile("/d", "duration", &[]).unwrap().is_valid("P"));
        assert!(compile("/d", "time", &[]).unwrap().is_valid("23:59:01Z"));
    }

    #[test]
    fn integer_value_equality_is_typed() {
        let ns = MapNs(HashMap::new());
        let v = compile_value("/value", "integer", "007", &ns).unwrap();
        assert!(v.is_valid("7"));
        assert!(v.is_valid(" 7 "));
        assert!(!v.is_valid("8"));
    }

    #[test]
    fn qname_value_resolves_prefix() {
        let mut map = HashMap::new();
        map.insert("foo".to_string(), "urn:x".to_string());
        let ns = MapNs(map);
        let v = compile_value("/value", "QName", "foo:bar", &ns).unwrap();
        assert_matches::assert_matches!(
            &v,
            XsdDatatypeValues::QName(q) => {
                assert_eq!(q.namespace_uri, "urn:x");
                assert_eq!(q.local_name, "bar");
            }
        );
        // same expanded name via a different prefix
        let mut map2 = HashMap::new();
        map2.insert("other".to_string(), "urn:x".to_string());
        assert!(v.is_valid_with_ns("other:bar", &MapNs(map2)));
        assert!(!v.is_valid_with_ns("foo:bar", &MapNs(HashMap::new())));
    }

    #[test]
    fn qname_value_unknown_prefix_fails() {
        let ns = MapNs(HashMap::new());
        assert!(matches!(
            compile_value("/value", "QName", "nope:bar", &ns),
            Err(DatatypeError::Value { .. })
        ));
    }

    #[test]
    fn unknown_type_name() {
        assert!(matches!(
            compile("/data", "frobnicator", &[]),
            Err(DatatypeError::UnknownDatatype { .. })
        ));
    }

    #[test]
    fn ncname_rejects_colon() {
        let dt = compile("/data", "NCName", &[]).unwrap();
        assert!(dt.is_valid("a-b.c"));
        assert!(!dt.is_valid("a:b"));
        assert!(!dt.is_valid("1ab"));
        assert!(!dt.is_valid(""));
    }
}
