use chrono::{DateTime, FixedOffset, Utc};
use reqwest::Url;

use crate::models::VisitConfirmation;

const ICS_UTC: &str = "%Y%m%dT%H%M%SZ";

fn utc_stamp(dt: &DateTime<FixedOffset>) -> String {
    dt.with_timezone(&Utc).format(ICS_UTC).to_string()
}

fn escape_text(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}

pub fn generate_ics(
    confirmation: &VisitConfirmation,
    business_name: &str,
    stamp: DateTime<Utc>,
) -> String {
    let dtstart = utc_stamp(&confirmation.slot.start);
    let dtend = utc_stamp(&confirmation.slot.end);
    let dtstamp = stamp.format(ICS_UTC).to_string();
    let uid = format!("{}@visit-scheduler", confirmation.visit_id);

    let summary = escape_text(&format!("Visita con {business_name}"));
    let description = escape_text(&visit_description(confirmation));

    format!(
        "BEGIN:VCALENDAR\r\n\
         VERSION:2.0\r\n\
         PRODID:-//Visit Scheduler//Visits//ES\r\n\
         BEGIN:VEVENT\r\n\
         UID:{uid}\r\n\
         DTSTAMP:{dtstamp}\r\n\
         DTSTART:{dtstart}\r\n\
         DTEND:{dtend}\r\n\
         SUMMARY:{summary}\r\n\
         DESCRIPTION:{description}\r\n\
         END:VEVENT\r\n\
         END:VCALENDAR\r\n"
    )
}

/// Google Calendar "add event" template link for the booked slot.
pub fn google_calendar_url(confirmation: &VisitConfirmation, business_name: &str) -> String {
    let dates = format!(
        "{}/{}",
        utc_stamp(&confirmation.slot.start),
        utc_stamp(&confirmation.slot.end)
    );
    let title = format!("Visita con {business_name}");
    let details = visit_description(confirmation);
    let params = [
        ("action", "TEMPLATE"),
        ("text", title.as_str()),
        ("dates", dates.as_str()),
        ("details", details.as_str()),
    ];
    Url::parse_with_params("https://calendar.google.com/calendar/render", &params)
        .map(String::from)
        .unwrap_or_default()
}

fn visit_description(confirmation: &VisitConfirmation) -> String {
    let mut lines = Vec::new();
    if !confirmation.message.is_empty() {
        lines.push(confirmation.message.clone());
    }
    if let Some(agent) = &confirmation.agent {
        let mut contact = format!("Agente: {}", agent.name);
        if let Some(phone) = &agent.phone {
            contact.push_str(&format!(" ({phone})"));
        }
        lines.push(contact);
    }
    lines.push(format!("Reserva: {}", confirmation.visit_id));
    lines.join("\n")
}
