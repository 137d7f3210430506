//! Structural validation of untrusted JSON before it is turned into typed
//! blocks, transactions or peer responses.

use crate::crypto;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Id,
    Address,
    PublicKeyBuf,
    SignatureBuf,
    Sha256Buf,
    Hex,
}

impl Format {
    fn name(&self) -> &'static str {
        match self {
            Format::Id => "id",
            Format::Address => "address",
            Format::PublicKeyBuf => "publicKeyBuf",
            Format::SignatureBuf => "signatureBuf",
            Format::Sha256Buf => "sha256Buf",
            Format::Hex => "hex",
        }
    }

    fn byte_len(&self) -> Option<usize> {
        match self {
            Format::PublicKeyBuf | Format::Sha256Buf => Some(32),
            Format::SignatureBuf => Some(64),
            _ => None,
        }
    }

    fn check_str(&self, s: &str) -> bool {
        match self {
            Format::Id => crypto::is_valid_id(s),
            Format::Address => crypto::is_valid_address(s),
            Format::Hex => hex::decode(s).is_ok(),
            _ => match hex::decode(s) {
                Ok(bytes) => Some(bytes.len()) == self.byte_len(),
                Err(_) => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Property {
    Integer {
        minimum: i64,
        maximum: Option<i64>,
    },
    /// Integer or decimal string, sign permitted.
    Amount,
    String {
        min_length: usize,
        max_length: usize,
        format: Option<Format>,
    },
    /// Hex string or array of byte values.
    Bytes(Format),
    Boolean,
    Array {
        max_items: Option<usize>,
        items: Option<&'static Property>,
    },
    Object(Option<&'static ObjectSchema>),
    /// Either `null` or the nested schema.
    Nullable(&'static Property),
}

#[derive(Debug)]
pub struct ObjectSchema {
    pub id: &'static str,
    pub required: &'static [&'static str],
    pub properties: &'static [(&'static str, Property)],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, value: &Value, schema: &ObjectSchema) -> Result<(), Vec<SchemaError>>;

    /// First error only, which is what callers surface.
    fn check(&self, value: &Value, schema: &ObjectSchema) -> Result<(), SchemaError> {
        self.validate(value, schema)
            .map_err(|mut errors| errors.remove(0))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, value: &Value, schema: &ObjectSchema) -> Result<(), Vec<SchemaError>> {
        let mut errors = Vec::new();
        validate_object(value, schema, "#", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn push(errors: &mut Vec<SchemaError>, path: &str, message: String) {
    errors.push(SchemaError {
        path: path.to_string(),
        message,
    });
}

fn validate_object(value: &Value, schema: &ObjectSchema, path: &str, errors: &mut Vec<SchemaError>) {
    let Some(object) = value.as_object() else {
        push(
            errors,
            path,
            format!("Expected type object but found type {}", type_name(value)),
        );
        return;
    };

    for name in schema.required {
        if object.get(*name).map_or(true, Value::is_null) {
            push(errors, path, format!("Missing required property: {name}"));
        }
    }

    for (name, property) in schema.properties {
        match object.get(*name) {
            None | Some(Value::Null) => {}
            Some(field) => validate_property(field, property, &format!("{path}/{name}"), errors),
        }
    }
}

fn validate_property(value: &Value, property: &Property, path: &str, errors: &mut Vec<SchemaError>) {
    match property {
        Property::Integer { minimum, maximum } => {
            let number = value.as_i64().map(i128::from).or(value.as_u64().map(i128::from));
            let Some(number) = number else {
                push(
                    errors,
                    path,
                    format!("Expected type integer but found type {}", type_name(value)),
                );
                return;
            };
            if number < i128::from(*minimum) {
                push(errors, path, format!("Value {number} is less than minimum {minimum}"));
            }
            if let Some(maximum) = maximum {
                if number > i128::from(*maximum) {
                    push(errors, path, format!("Value {number} is greater than maximum {maximum}"));
                }
            }
        }
        Property::Amount => {
            let valid = match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => {
                    let digits = s.strip_prefix('-').unwrap_or(s);
                    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
                }
                _ => false,
            };
            if !valid {
                push(
                    errors,
                    path,
                    format!("Expected type integer but found type {}", type_name(value)),
                );
            }
        }
        Property::String {
            min_length,
            max_length,
            format,
        } => {
            let Some(s) = value.as_str() else {
                push(
                    errors,
                    path,
                    format!("Expected type string but found type {}", type_name(value)),
                );
                return;
            };
            let len = s.chars().count();
            if len > *max_length {
                push(
                    errors,
                    path,
                    format!("String is too long ({len} chars), maximum {max_length}"),
                );
            } else if len < *min_length {
                push(
                    errors,
                    path,
                    format!("String is too short ({len} chars), minimum {min_length}"),
                );
            } else if let Some(format) = format {
                if !format.check_str(s) {
                    push(
                        errors,
                        path,
                        format!("Object didn't pass validation for format {}: {s}", format.name()),
                    );
                }
            }
        }
        Property::Bytes(format) => {
            let valid = match value {
                Value::String(s) => format.check_str(s),
                Value::Array(items) => {
                    let bytes_ok = items
                        .iter()
                        .all(|item| item.as_u64().map_or(false, |b| b <= 255));
                    bytes_ok && format.byte_len().map_or(true, |len| len == items.len())
                }
                _ => false,
            };
            if !valid {
                let shown = match value {
                    Value::String(s) => format!(": {s}"),
                    _ => String::new(),
                };
                push(
                    errors,
                    path,
                    format!("Object didn't pass validation for format {}{shown}", format.name()),
                );
            }
        }
        Property::Boolean => {
            if !value.is_boolean() {
                push(
                    errors,
                    path,
                    format!("Expected type boolean but found type {}", type_name(value)),
                );
            }
        }
        Property::Array { max_items, items } => {
            let Some(array) = value.as_array() else {
                push(
                    errors,
                    path,
                    format!("Expected type array but found type {}", type_name(value)),
                );
                return;
            };
            if let Some(max_items) = max_items {
                if array.len() > *max_items {
                    push(
                        errors,
                        path,
                        format!("Array is too long ({}), maximum {max_items}", array.len()),
                    );
                }
            }
            if let Some(items) = items {
                for (index, item) in array.iter().enumerate() {
                    validate_property(item, items, &format!("{path}/{index}"), errors);
                }
            }
        }
        Property::Object(schema) => match schema {
            Some(schema) => validate_object(value, schema, path, errors),
            None if !value.is_object() => push(
                errors,
                path,
                format!("Expected type object but found type {}", type_name(value)),
            ),
            None => {}
        },
        Property::Nullable(inner) => {
            if !value.is_null() {
                validate_property(value, inner, path, errors);
            }
        }
    }
}

const ID: Property = Property::String {
    min_length: 1,
    max_length: 20,
    format: Some(Format::Id),
};

const ADDRESS: Property = Property::String {
    min_length: 1,
    max_length: 22,
    format: Some(Format::Address),
};

static SIGNATURE_ITEM: Property = Property::Bytes(Format::SignatureBuf);
static TRANSACTION_ITEM: Property = Property::Object(Some(&TRANSACTION));
static SIGNATURE_HEX_ITEM: Property = Property::String {
    min_length: 128,
    max_length: 128,
    format: Some(Format::Hex),
};
static SIGNATURE_BUNDLE_ITEM: Property = Property::Object(Some(&SIGNATURE_BUNDLE));
static COMMON_BLOCK_OBJECT: Property = Property::Object(Some(&COMMON_BLOCK));

pub static TRANSACTION: ObjectSchema = ObjectSchema {
    id: "Transaction",
    required: &["type", "timestamp", "senderPublicKey", "signature", "fee", "amount"],
    properties: &[
        ("id", ID),
        (
            "type",
            Property::Integer {
                minimum: 0,
                maximum: Some(255),
            },
        ),
        (
            "timestamp",
            Property::Integer {
                minimum: 0,
                maximum: Some(u32::MAX as i64),
            },
        ),
        ("senderPublicKey", Property::Bytes(Format::PublicKeyBuf)),
        ("requesterPublicKey", Property::Bytes(Format::PublicKeyBuf)),
        ("senderId", ADDRESS),
        ("recipientId", ADDRESS),
        ("amount", Property::Amount),
        ("fee", Property::Amount),
        ("signature", Property::Bytes(Format::SignatureBuf)),
        (
            "signatures",
            Property::Array {
                max_items: Some(16),
                items: Some(&SIGNATURE_ITEM),
            },
        ),
        ("asset", Property::Object(None)),
    ],
};

pub static BLOCK: ObjectSchema = ObjectSchema {
    id: "Block",
    required: &[
        "id",
        "version",
        "timestamp",
        "height",
        "numberOfTransactions",
        "totalAmount",
        "totalFee",
        "reward",
        "payloadLength",
        "payloadHash",
        "generatorPublicKey",
        "blockSignature",
        "transactions",
    ],
    properties: &[
        ("id", ID),
        (
            "version",
            Property::Integer {
                minimum: 0,
                maximum: Some(u32::MAX as i64),
            },
        ),
        (
            "timestamp",
            Property::Integer {
                minimum: 0,
                maximum: Some(u32::MAX as i64),
            },
        ),
        (
            "height",
            Property::Integer {
                minimum: 1,
                maximum: None,
            },
        ),
        ("previousBlock", ID),
        (
            "numberOfTransactions",
            Property::Integer {
                minimum: 0,
                maximum: None,
            },
        ),
        ("totalAmount", Property::Amount),
        ("totalFee", Property::Amount),
        ("reward", Property::Amount),
        (
            "payloadLength",
            Property::Integer {
                minimum: 0,
                maximum: None,
            },
        ),
        ("payloadHash", Property::Bytes(Format::Sha256Buf)),
        ("generatorPublicKey", Property::Bytes(Format::PublicKeyBuf)),
        ("blockSignature", Property::Bytes(Format::SignatureBuf)),
        (
            "transactions",
            Property::Array {
                max_items: None,
                items: Some(&TRANSACTION_ITEM),
            },
        ),
    ],
};

pub static COMMON_BLOCK: ObjectSchema = ObjectSchema {
    id: "CommonBlock",
    required: &["id", "previousBlock", "height"],
    properties: &[
        ("id", ID),
        ("previousBlock", ID),
        (
            "height",
            Property::Integer {
                minimum: 1,
                maximum: None,
            },
        ),
    ],
};

pub static COMMON_BLOCK_RESPONSE: ObjectSchema = ObjectSchema {
    id: "CommonBlockResponse",
    required: &[],
    properties: &[("common", Property::Nullable(&COMMON_BLOCK_OBJECT))],
};

pub static LOADER_HEIGHT: ObjectSchema = ObjectSchema {
    id: "LoaderHeight",
    required: &["height"],
    properties: &[(
        "height",
        Property::Integer {
            minimum: 1,
            maximum: None,
        },
    )],
};

pub static LOADER_TRANSACTIONS: ObjectSchema = ObjectSchema {
    id: "LoaderTransactions",
    required: &["transactions"],
    properties: &[(
        "transactions",
        Property::Array {
            max_items: Some(100),
            items: None,
        },
    )],
};

pub static SIGNATURE_BUNDLE: ObjectSchema = ObjectSchema {
    id: "SignatureBundle",
    required: &["transaction", "signatures"],
    properties: &[
        ("transaction", ID),
        (
            "signatures",
            Property::Array {
                max_items: Some(16),
                items: Some(&SIGNATURE_HEX_ITEM),
            },
        ),
    ],
};

pub static LOADER_SIGNATURES: ObjectSchema = ObjectSchema {
    id: "LoaderSignatures",
    required: &["signatures"],
    properties: &[(
        "signatures",
        Property::Array {
            max_items: Some(100),
            items: Some(&SIGNATURE_BUNDLE_ITEM),
        },
    )],
};
