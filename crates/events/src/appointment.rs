//! Appointment lifecycle notices.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hap_core::AppointmentId;

use crate::event::Event;
use crate::topic::{APPOINTMENTS_CANCELED, APPOINTMENTS_CREATED, APPOINTMENTS_UPDATED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentChange {
    Created,
    Updated,
    Canceled,
}

/// Notice that an appointment was created, changed or canceled.
///
/// `details` is whatever the scheduling side wants consumers to see; it is
/// carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentNotice {
    pub appointment_id: AppointmentId,
    pub change: AppointmentChange,
    #[serde(default)]
    pub details: JsonValue,
}

impl AppointmentNotice {
    pub fn new(appointment_id: AppointmentId, change: AppointmentChange, details: JsonValue) -> Self {
        Self {
            appointment_id,
            change,
            details,
        }
    }
}

impl Event for AppointmentNotice {
    fn event_type(&self) -> &'static str {
        match self.change {
            AppointmentChange::Created => "appointment.created",
            AppointmentChange::Updated => "appointment.updated",
            AppointmentChange::Canceled => "appointment.canceled",
        }
    }

    fn topic(&self) -> &'static str {
        match self.change {
            AppointmentChange::Created => APPOINTMENTS_CREATED,
            AppointmentChange::Updated => APPOINTMENTS_UPDATED,
            AppointmentChange::Canceled => APPOINTMENTS_CANCELED,
        }
    }

    fn partition_key(&self) -> String {
        self.appointment_id.to_string()
    }
}
