use crate::checkin::CheckInRequest;
use crate::errors::{Error, Result};
use crate::registry::Registration;
use crate::telemetry::NewReading;
use serde_json::Value;

const MAX_EXTERNAL_ID_LEN: usize = 128;
const MAX_SENSOR_TYPE_LEN: usize = 64;
const MAX_VALUE_LEN: usize = 1024;
/// One week.
pub const MAX_CHECK_IN_INTERVAL_SECS: i64 = 7 * 24 * 3600;

/// Validates a device identifier
pub fn validate_external_id(external_id: &str) -> Result<()> {
    if external_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    if external_id.len() > MAX_EXTERNAL_ID_LEN {
        return Err(Error::Validation(format!(
            "Device ID longer than {} characters",
            MAX_EXTERNAL_ID_LEN
        )));
    }
    Ok(())
}

pub fn validate_registration(registration: &Registration) -> Result<()> {
    validate_external_id(&registration.external_id)?;

    if let Some(device_type) = &registration.device_type {
        if device_type.trim().is_empty() {
            return Err(Error::Validation("Device type cannot be empty".to_string()));
        }
    }

    if let Some(interval) = registration.check_in_interval_secs {
        if interval <= 0 || interval > MAX_CHECK_IN_INTERVAL_SECS {
            return Err(Error::Validation(format!(
                "Check-in interval must be between 1 and {} seconds, got {}",
                MAX_CHECK_IN_INTERVAL_SECS, interval
            )));
        }
    }

    Ok(())
}

fn validate_sensor_type(sensor_type: &str) -> Result<()> {
    if sensor_type.trim().is_empty() {
        return Err(Error::Validation("Sensor type cannot be empty".to_string()));
    }
    if sensor_type.len() > MAX_SENSOR_TYPE_LEN {
        return Err(Error::Validation(format!(
            "Sensor type longer than {} characters",
            MAX_SENSOR_TYPE_LEN
        )));
    }
    Ok(())
}

fn validate_value_text(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation("Reading value cannot be empty".to_string()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::Validation(format!(
            "Reading value longer than {} characters",
            MAX_VALUE_LEN
        )));
    }
    Ok(())
}

/// Validates a reading before it is stored
pub fn validate_reading(reading: &NewReading) -> Result<()> {
    validate_sensor_type(&reading.sensor_type)?;
    validate_value_text(&reading.value)?;
    if reading.source.trim().is_empty() {
        return Err(Error::Validation("Reading source cannot be empty".to_string()));
    }
    Ok(())
}

/// Validates a whole check-in. Nothing is written when this fails.
pub fn validate_checkin(request: &CheckInRequest, max_telemetry_batch: usize) -> Result<()> {
    validate_registration(&request.registration())?;

    if request.telemetry.len() > max_telemetry_batch {
        return Err(Error::Validation(format!(
            "Telemetry batch of {} exceeds the limit of {}",
            request.telemetry.len(),
            max_telemetry_batch
        )));
    }

    for item in &request.telemetry {
        validate_sensor_type(&item.sensor_type)?;
        match &item.value {
            Value::Null | Value::Array(_) | Value::Object(_) => {
                return Err(Error::Validation(format!(
                    "Reading value for {} must be a string or a scalar",
                    item.sensor_type
                )));
            }
            _ => validate_value_text(&item.value_text())?,
        }
        if let Some(owner) = item.owner_ids.iter().flatten().find(|id| **id <= 0) {
            return Err(Error::Validation(format!("Invalid owner id {}", owner)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkin::TelemetryItem;
    use chrono::Utc;
    use serde_json::json;

    fn checkin(telemetry: Vec<TelemetryItem>) -> CheckInRequest {
        CheckInRequest {
            device_id: "dev-1".to_string(),
            telemetry,
            ..CheckInRequest::default()
        }
    }

    fn item(value: Value) -> TelemetryItem {
        TelemetryItem {
            sensor_type: "temp".to_string(),
            value,
            recorded_at: None,
            owner_ids: None,
        }
    }

    #[test]
    fn test_valid_checkin() {
        assert!(validate_checkin(&checkin(vec![item(json!(25.0)), item(json!("60 %"))]), 10).is_ok());
    }

    #[test]
    fn test_empty_device_id() {
        let mut request = checkin(vec![]);
        request.device_id = "".to_string();
        assert!(validate_checkin(&request, 10).is_err());
    }

    #[test]
    fn test_batch_limit() {
        let request = checkin(vec![item(json!(1)), item(json!(2)), item(json!(3))]);
        assert!(validate_checkin(&request, 2).is_err());
        assert!(validate_checkin(&request, 3).is_ok());
    }

    #[test]
    fn test_structured_value_rejected() {
        assert!(validate_checkin(&checkin(vec![item(json!({ "t": 1 }))]), 10).is_err());
        assert!(validate_checkin(&checkin(vec![item(Value::Null)]), 10).is_err());
        assert!(validate_checkin(&checkin(vec![item(json!(""))]), 10).is_err());
    }

    #[test]
    fn test_invalid_owner_id() {
        let mut bad = item(json!(1));
        bad.owner_ids = Some(vec![42, 0]);
        assert!(validate_checkin(&checkin(vec![bad]), 10).is_err());
    }

    #[test]
    fn test_invalid_interval() {
        let mut request = checkin(vec![]);
        request.check_in_interval_secs = Some(0);
        assert!(validate_checkin(&request, 10).is_err());

        request.check_in_interval_secs = Some(i64::MAX / 2);
        assert!(validate_checkin(&request, 10).is_err());

        request.check_in_interval_secs = Some(MAX_CHECK_IN_INTERVAL_SECS);
        assert!(validate_checkin(&request, 10).is_ok());
    }

    #[test]
    fn test_reading_needs_source() {
        let reading = NewReading {
            sensor_type: "temp".to_string(),
            value: "21".to_string(),
            recorded_at: Utc::now(),
            source: " ".to_string(),
        };
        assert!(validate_reading(&reading).is_err());
    }
}
