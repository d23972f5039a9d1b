// src/utils/countries.rs
//! Countries accepted on the registration form (ISO 3166-1 alpha-2).

/// `(code, name)` pairs in display order.
pub const COUNTRIES: &[(&str, &str)] = &[
    ("US", "United States"),
    ("GB", "United Kingdom"),
    ("CA", "Canada"),
    ("AU", "Australia"),
    ("DE", "Germany"),
    ("FR", "France"),
    ("ES", "Spain"),
    ("IT", "Italy"),
    ("NL", "Netherlands"),
    ("BE", "Belgium"),
    ("CH", "Switzerland"),
    ("AT", "Austria"),
    ("SE", "Sweden"),
    ("NO", "Norway"),
    ("DK", "Denmark"),
    ("FI", "Finland"),
    ("IE", "Ireland"),
    ("PT", "Portugal"),
    ("GR", "Greece"),
    ("LU", "Luxembourg"),
    ("JP", "Japan"),
    ("CN", "China"),
    ("IN", "India"),
    ("BR", "Brazil"),
    ("MX", "Mexico"),
    ("ZA", "South Africa"),
    ("AE", "United Arab Emirates"),
    ("SG", "Singapore"),
    ("KR", "South Korea"),
    ("NZ", "New Zealand"),
];

/// Returns the display name for `code`, if it is a known country.
pub fn country_name(code: &str) -> Option<&'static str> {
    COUNTRIES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

pub fn is_valid_country(code: &str) -> bool {
    country_name(code).is_some()
}
