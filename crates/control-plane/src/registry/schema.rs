//! Field descriptor construction and schema composition.

use std::collections::BTreeSet;

use common::api::{FieldDescriptor, FieldKind, FieldVisibility, ResolutionHint};
use serde_json::{Value, json};

/// Name of the common port field carried by every schema.
pub const PORT_FIELD: &str = "port";

pub(crate) fn field(name: &str, kind: FieldKind) -> FieldDescriptor {
    FieldDescriptor {
        name: name.to_string(),
        kind,
        options: Vec::new(),
        hint: ResolutionHint::None,
        visibility: FieldVisibility::Client,
        default: None,
        required: false,
        aliases: Vec::new(),
    }
}

pub(crate) fn string(name: &str, default: &str) -> FieldDescriptor {
    field(name, FieldKind::String).with_default(json!(default))
}

pub(crate) fn number(name: &str, default: i64) -> FieldDescriptor {
    field(name, FieldKind::Number).with_default(json!(default))
}

pub(crate) fn boolean(name: &str, default: bool) -> FieldDescriptor {
    field(name, FieldKind::Boolean).with_default(json!(default))
}

pub(crate) fn port(name: &str, default: u16) -> FieldDescriptor {
    field(name, FieldKind::Port).with_default(json!(default))
}

pub(crate) fn choice(name: &str, options: &[&str], default: &str) -> FieldDescriptor {
    field(name, FieldKind::Enum)
        .with_options(options)
        .with_default(json!(default))
}

pub(crate) fn multi_choice(name: &str, options: &[&str], default: &[&str]) -> FieldDescriptor {
    field(name, FieldKind::MultiEnum)
        .with_options(options)
        .with_default(json!(default))
}

/// Builder-style adjustments used by the static tables.
pub(crate) trait FieldDescriptorExt {
    fn with_default(self, value: Value) -> Self;
    fn with_options(self, options: &[&str]) -> Self;
    fn with_hint(self, hint: ResolutionHint) -> Self;
    fn required(self) -> Self;
    fn server_side(self) -> Self;
    fn alias(self, alias: &str) -> Self;
}

impl FieldDescriptorExt for FieldDescriptor {
    fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    fn with_hint(mut self, hint: ResolutionHint) -> Self {
        self.hint = hint;
        self
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn server_side(mut self) -> Self {
        self.visibility = FieldVisibility::ServerSide;
        self
    }

    fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }
}

/// Concatenates field sets, keeping the first descriptor for each name.
pub fn merge_fields<'a, I>(sets: I) -> Vec<FieldDescriptor>
where
    I: IntoIterator<Item = &'a [FieldDescriptor]>,
{
    let mut seen = BTreeSet::new();
    let mut merged = Vec::new();
    for set in sets {
        for descriptor in set {
            if seen.insert(descriptor.name.clone()) {
                merged.push(descriptor.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_first_descriptor_per_name() {
        let protocol = vec![string("sni", "first"), number("alter_id", 0)];
        let tls = vec![string("sni", "second"), boolean("allow_insecure", false)];

        let merged = merge_fields([protocol.as_slice(), tls.as_slice()]);
        let names: Vec<_> = merged.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["sni", "alter_id", "allow_insecure"]);
        assert_eq!(merged[0].default, Some(json!("first")));
    }

    #[test]
    fn builder_sets_visibility_and_aliases() {
        let descriptor = string("private_key", "")
            .server_side()
            .alias("reality_private_key");
        assert_eq!(descriptor.visibility, FieldVisibility::ServerSide);
        assert_eq!(descriptor.aliases, vec!["reality_private_key".to_string()]);
        assert!(!descriptor.required);
    }
}
