use actix_multipart::Multipart;
use futures_util::{StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

use crate::models::parcel::ParcelStatus;
use crate::models::party::UpsertParty;
use crate::services::storage::{extension_for, MAX_IMAGE_BYTES};

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

/// The registration/edit form after multipart decoding and validation.
/// `status` and `remove_image` only appear on the edit form.
#[derive(Debug, Clone)]
pub struct ParcelForm {
    pub sender: UpsertParty,
    pub recipient: UpsertParty,
    pub origin_town: String,
    pub destination_town: String,
    pub destination_address: String,
    pub description: Option<String>,
    pub image: Option<UploadedImage>,
    pub remove_image: bool,
    pub amount: Decimal,
    pub payment_phone: String,
    pub idempotency_key: Option<String>,
    pub status: Option<ParcelStatus>,
}

const NAME_MAX: usize = 255;
const PHONE_MAX: usize = 15;
const NATIONAL_ID_MAX: usize = 20;
const IDEMPOTENCY_KEY_MAX: usize = 64;

pub async fn parse_parcel_form(mut payload: Multipart) -> Result<ParcelForm, Vec<String>> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut image: Option<UploadedImage> = None;
    let mut errors: Vec<String> = Vec::new();

    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(vec![format!("Malformed form data: {}", e)]),
        };

        let name = field
            .content_disposition()
            .get_name()
            .unwrap_or_default()
            .to_string();

        if name == "image" {
            let extension = field.content_type().and_then(extension_for);

            let mut bytes: Vec<u8> = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => return Err(vec![format!("Malformed form data: {}", e)]),
                };
                if bytes.len() + chunk.len() > MAX_IMAGE_BYTES {
                    return Err(vec!["The image must be less than 2MB.".to_string()]);
                }
                bytes.extend_from_slice(&chunk);
            }

            // An empty file part means no image was attached.
            if bytes.is_empty() {
                continue;
            }

            match extension {
                Some(extension) => image = Some(UploadedImage { bytes, extension }),
                None => {
                    errors.push("The image must be a JPG, JPEG, PNG, or WEBP file.".to_string())
                }
            }
            continue;
        }

        let mut value: Vec<u8> = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Err(vec![format!("Malformed form data: {}", e)]),
            };
            value.extend_from_slice(&chunk);
        }
        fields.insert(name, String::from_utf8_lossy(&value).trim().to_string());
    }

    validate(fields, image, errors)
}

fn validate(
    mut fields: HashMap<String, String>,
    image: Option<UploadedImage>,
    mut errors: Vec<String>,
) -> Result<ParcelForm, Vec<String>> {
    let sender = UpsertParty {
        first_name: take_required(&mut fields, "sender_first_name", NAME_MAX, &mut errors),
        last_name: take_required(&mut fields, "sender_last_name", NAME_MAX, &mut errors),
        national_id: take_required(&mut fields, "sender_national_id", NATIONAL_ID_MAX, &mut errors),
        phone: take_required(&mut fields, "sender_phone", PHONE_MAX, &mut errors),
    };

    let recipient = UpsertParty {
        first_name: take_required(&mut fields, "recipient_first_name", NAME_MAX, &mut errors),
        last_name: take_required(&mut fields, "recipient_last_name", NAME_MAX, &mut errors),
        national_id: take_required(
            &mut fields,
            "recipient_national_id",
            NATIONAL_ID_MAX,
            &mut errors,
        ),
        phone: take_required(&mut fields, "recipient_phone", PHONE_MAX, &mut errors),
    };

    let origin_town = take_required(&mut fields, "origin_town", NAME_MAX, &mut errors);
    let destination_town = take_required(&mut fields, "destination_town", NAME_MAX, &mut errors);
    let destination_address =
        take_required(&mut fields, "destination_address", usize::MAX, &mut errors);
    let payment_phone = take_required(&mut fields, "payment_phone", PHONE_MAX, &mut errors);

    let description = take_optional(&mut fields, "description");

    let idempotency_key = take_optional(&mut fields, "idempotency_key");
    if let Some(key) = &idempotency_key {
        if key.len() > IDEMPOTENCY_KEY_MAX {
            errors.push(format!(
                "The idempotency key field must not exceed {} characters.",
                IDEMPOTENCY_KEY_MAX
            ));
        }
    }

    let amount = match fields.remove("amount").filter(|v| !v.is_empty()) {
        Some(raw) => match Decimal::from_str(&raw) {
            Ok(amount) if amount >= Decimal::ZERO => amount,
            Ok(_) => {
                errors.push("The amount must be at least 0.".to_string());
                Decimal::ZERO
            }
            Err(_) => {
                errors.push("The amount must be a number.".to_string());
                Decimal::ZERO
            }
        },
        None => {
            errors.push("The amount field is required.".to_string());
            Decimal::ZERO
        }
    };

    let status = match fields.remove("status").filter(|v| !v.is_empty()) {
        Some(raw) => match raw.parse::<ParcelStatus>() {
            Ok(status) => Some(status),
            Err(()) => {
                errors.push("The selected status is invalid.".to_string());
                None
            }
        },
        None => None,
    };

    let remove_image = fields
        .remove("remove_image")
        .map(|v| matches!(v.as_str(), "1" | "true" | "on"))
        .unwrap_or(false);

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ParcelForm {
        sender,
        recipient,
        origin_town,
        destination_town,
        destination_address,
        description,
        image,
        remove_image,
        amount,
        payment_phone,
        idempotency_key,
        status,
    })
}

fn take_required(
    fields: &mut HashMap<String, String>,
    name: &str,
    max: usize,
    errors: &mut Vec<String>,
) -> String {
    match fields.remove(name).filter(|v| !v.is_empty()) {
        Some(value) if value.chars().count() <= max => value,
        Some(_) => {
            errors.push(format!(
                "The {} field must not exceed {} characters.",
                label(name),
                max
            ));
            String::new()
        }
        None => {
            errors.push(format!("The {} field is required.", label(name)));
            String::new()
        }
    }
}

fn take_optional(fields: &mut HashMap<String, String>, name: &str) -> Option<String> {
    fields.remove(name).filter(|v| !v.is_empty())
}

fn label(name: &str) -> String {
    name.replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn complete_fields() -> HashMap<String, String> {
        [
            ("sender_first_name", "John"),
            ("sender_last_name", "Mwangi"),
            ("sender_phone", "0712345678"),
            ("sender_national_id", "12345678"),
            ("origin_town", "Nairobi"),
            ("recipient_first_name", "Mary"),
            ("recipient_last_name", "Atieno"),
            ("recipient_phone", "0798765432"),
            ("recipient_national_id", "87654321"),
            ("destination_town", "Mombasa"),
            ("destination_address", "Moi Ave 12"),
            ("amount", "150.50"),
            ("payment_phone", "0712345678"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn complete_form_validates() {
        let form = validate(complete_fields(), None, Vec::new()).expect("should validate");

        assert_eq!(form.sender.first_name, "John");
        assert_eq!(form.recipient.phone, "0798765432");
        assert_eq!(form.amount, dec!(150.50));
        assert_eq!(form.status, None);
        assert!(!form.remove_image);
        assert_eq!(form.idempotency_key, None);
    }

    #[test]
    fn missing_fields_are_reported_individually() {
        let mut fields = complete_fields();
        fields.remove("sender_phone");
        fields.remove("destination_town");

        let errors = validate(fields, None, Vec::new()).unwrap_err();

        assert!(errors.iter().any(|e| e.contains("sender phone")));
        assert!(errors.iter().any(|e| e.contains("destination town")));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn negative_amount_is_rejected() {
        let mut fields = complete_fields();
        fields.insert("amount".to_string(), "-5".to_string());

        let errors = validate(fields, None, Vec::new()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("at least 0")));
    }

    #[test]
    fn non_numeric_amount_is_rejected() {
        let mut fields = complete_fields();
        fields.insert("amount".to_string(), "lots".to_string());

        let errors = validate(fields, None, Vec::new()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must be a number")));
    }

    #[test]
    fn overlong_phone_is_rejected() {
        let mut fields = complete_fields();
        fields.insert("payment_phone".to_string(), "0".repeat(16));

        let errors = validate(fields, None, Vec::new()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("payment phone")));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut fields = complete_fields();
        fields.insert("status".to_string(), "shipped".to_string());

        let errors = validate(fields, None, Vec::new()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("status is invalid")));
    }

    #[test]
    fn status_and_flags_parse_on_edit_form() {
        let mut fields = complete_fields();
        fields.insert("status".to_string(), "in_transit".to_string());
        fields.insert("remove_image".to_string(), "1".to_string());
        fields.insert("idempotency_key".to_string(), "req-42".to_string());

        let form = validate(fields, None, Vec::new()).expect("should validate");
        assert_eq!(form.status, Some(ParcelStatus::InTransit));
        assert!(form.remove_image);
        assert_eq!(form.idempotency_key.as_deref(), Some("req-42"));
    }

    #[test]
    fn unsupported_image_error_is_kept_with_field_errors() {
        let mut fields = complete_fields();
        fields.remove("origin_town");
        let pre_existing = vec!["The image must be a JPG, JPEG, PNG, or WEBP file.".to_string()];

        let errors = validate(fields, None, pre_existing).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
