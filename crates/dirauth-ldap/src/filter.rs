//! Search filter construction.

/// Object class of the group entries consulted for membership checks.
pub const GROUP_OBJECT_CLASS: &str = "groupOfUniqueNames";
/// Member attribute of [`GROUP_OBJECT_CLASS`] entries.
pub const GROUP_MEMBER_ATTRIBUTE: &str = "uniqueMember";

/// Escapes a value for inclusion in a search filter (RFC 4515).
///
/// Only `*`, `(`, `)`, `\` and NUL are rewritten, so ordinary logins and distinguished names pass
/// through unchanged.
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Builds `(&(objectClass=<object_class>)(<attribute>=<value>))`.
///
/// With `escape` off the value is concatenated verbatim.
#[must_use]
pub fn equality_filter(object_class: &str, attribute: &str, value: &str, escape: bool) -> String {
    if escape {
        format!(
            "(&(objectClass={object_class})({attribute}={}))",
            escape_filter_value(value)
        )
    } else {
        format!("(&(objectClass={object_class})({attribute}={value}))")
    }
}

/// Filter selecting the group entries that list `member_dn` as a member.
#[must_use]
pub fn group_membership_filter(member_dn: &str, escape: bool) -> String {
    equality_filter(GROUP_OBJECT_CLASS, GROUP_MEMBER_ATTRIBUTE, member_dn, escape)
}
