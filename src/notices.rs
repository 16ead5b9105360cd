//! Wording for expiry and warning notices, sent by email and stored as
//! in-app notifications.

use chrono::NaiveDateTime;

use crate::mailer::OutgoingEmail;
use crate::model::{Booking, NotificationKind};

/// Everything the sweep says about one booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NotificationKind,
    pub subject: String,
    pub html: String,
    pub title: String,
    pub message: String,
    pub link: String,
}

impl Notice {
    pub fn email(&self, to: &str) -> OutgoingEmail {
        OutgoingEmail {
            to: to.to_string(),
            subject: self.subject.clone(),
            html: self.html.clone(),
        }
    }
}

fn booking_link(booking: &Booking) -> String {
    format!("/bookings/{}", booking.id)
}

fn slot_line(booking: &Booking) -> String {
    format!(
        "{} on {}, {} {}-{}",
        booking.sport,
        booking.court_id,
        booking.booking_date.format("%a %d %b %Y"),
        booking.start_time,
        booking.end_time
    )
}

fn html_page(heading: &str, body: &str, link: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>{heading}</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2>{heading}</h2>
    <p>{body}</p>
    <p><a href="{link}">View your booking</a></p>
  </div>
</body>
</html>"#
    )
}

pub fn expired(booking: &Booking) -> Notice {
    let slot = slot_line(booking);
    let link = booking_link(booking);
    let message = format!("Your unpaid booking for {slot} has expired and the slot has been released.");
    Notice {
        kind: NotificationKind::BookingExpired,
        subject: "Your court booking has expired".into(),
        html: html_page("Booking expired", &message, &link),
        title: "Booking expired".into(),
        message,
        link,
    }
}

/// `deadline` is facility-local.
pub fn warning(booking: &Booking, hours_remaining: i64, deadline: NaiveDateTime) -> Notice {
    let slot = slot_line(booking);
    let link = booking_link(booking);
    let unit = if hours_remaining == 1 { "hour" } else { "hours" };
    let message = format!(
        "Your booking for {slot} expires in {hours_remaining} {unit} (at {}) unless it is confirmed.",
        deadline.format("%d %b %H:%M")
    );
    Notice {
        kind: NotificationKind::ExpirationWarning,
        subject: format!("Confirm your court booking within {hours_remaining} {unit}"),
        html: html_page("Booking about to expire", &message, &link),
        title: "Booking expiring soon".into(),
        message,
        link,
    }
}
