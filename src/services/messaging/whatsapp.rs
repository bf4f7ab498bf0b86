use chrono_tz::Tz;
use reqwest::Url;

use crate::models::VisitConfirmation;

/// `https://wa.me/<digits>?text=<message>` link, or `None` when the phone
/// number has no digits.
pub fn whatsapp_link(phone: &str, message: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let base = format!("https://wa.me/{digits}");
    if message.is_empty() {
        return Some(base);
    }
    Url::parse_with_params(&base, &[("text", message)])
        .ok()
        .map(String::from)
}

pub fn booking_message(confirmation: &VisitConfirmation, business_name: &str, tz: Tz) -> String {
    let start = confirmation.slot.start.with_timezone(&tz);
    format!(
        "Hola, tengo una visita agendada con {business_name} el {} a las {} (reserva {}).",
        start.format("%d-%m-%Y"),
        start.format("%H:%M"),
        confirmation.visit_id
    )
}
