//! San Francisco Fire Incidents (`data.sfgov.org`, dataset `wr8u-xric`).

use crate::Result;
use crate::loader::schema::{FieldSpec, FieldType, TableSchema};

pub const DEFAULT_NAMESPACE: &str = "incidents";
pub const DEFAULT_TABLE: &str = "incidents";
pub const KEY_FIELD: &str = "id";
pub const WATERMARK_FIELD: &str = "data_loaded_at";

const TEXT: &[&str] = &[
    "id",
    "incident_number",
    "exposure_number",
    "address",
    "call_number",
    "city",
    "zipcode",
    "battalion",
    "station_area",
    "box",
    "first_unit_on_scene",
    "primary_situation",
    "mutual_aid",
    "action_taken_primary",
    "action_taken_secondary",
    "action_taken_other",
    "detector_alerted_occupants",
    "property_use",
    "area_of_fire_origin",
    "ignition_cause",
    "ignition_factor_primary",
    "ignition_factor_secondary",
    "heat_source",
    "item_first_ignited",
    "human_factors_associated_with_ignition",
    "structure_type",
    "structure_status",
    "fire_spread",
    // Misspellings are the dataset's own column names.
    "no_flame_spead",
    "detectors_present",
    "detector_type",
    "detector_operation",
    "detector_effectiveness",
    "detector_failure_reason",
    "automatic_extinguishing_system_present",
    "automatic_extinguishing_sytem_type",
    "automatic_extinguishing_sytem_perfomance",
    "automatic_extinguishing_sytem_failure_reason",
    "supervisor_district",
    "neighborhood_district",
];

const INTEGER: &[&str] = &[
    "suppression_units",
    "suppression_personnel",
    "ems_units",
    "ems_personnel",
    "other_units",
    "other_personnel",
    "fire_fatalities",
    "fire_injuries",
    "civilian_fatalities",
    "civilian_injuries",
    "number_of_alarms",
    "floor_of_fire_origin",
    "number_of_floors_with_minimum_damage",
    "number_of_floors_with_significant_damage",
    "number_of_floors_with_heavy_damage",
    "number_of_floors_with_extreme_damage",
    "number_of_sprinkler_heads_operating",
];

const NUMBER: &[&str] = &["estimated_property_loss", "estimated_contents_loss"];

const TIMESTAMP: &[&str] = &[
    "incident_date",
    "alarm_dttm",
    "arrival_dttm",
    "close_dttm",
    "data_as_of",
    "data_loaded_at",
];

/// Declared schema of the fire incidents table.
///
/// `point` is kept as GeoJSON. Fields the portal adds later (such as
/// `:@computed_region_*`) are ignored unless the policy is switched to reject.
pub fn fire_incidents_schema() -> Result<TableSchema> {
    let typed = |names: &[&str], t: FieldType| {
        names
            .iter()
            .map(move |n| FieldSpec::new(*n, t))
            .collect::<Vec<_>>()
    };

    let mut fields = typed(TEXT, FieldType::Text);
    fields.extend(typed(INTEGER, FieldType::Integer));
    fields.extend(typed(NUMBER, FieldType::Number));
    fields.extend(typed(TIMESTAMP, FieldType::Timestamp));
    fields.push(FieldSpec::new("point", FieldType::Json));

    TableSchema::new(
        Some(DEFAULT_NAMESPACE.to_string()),
        DEFAULT_TABLE,
        KEY_FIELD,
        WATERMARK_FIELD,
        fields,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::models::RawRecord;
    use crate::loader::schema::{FieldValue, normalize_record};
    use serde_json::json;

    #[test]
    fn schema_is_valid_and_keyed_by_id() {
        let schema = fire_incidents_schema().unwrap();
        assert_eq!(schema.key_field, "id");
        assert_eq!(schema.watermark_field, "data_loaded_at");
        assert_eq!(schema.qualified_table(), "incidents.incidents");
        assert_eq!(schema.field_type("point"), Some(FieldType::Json));
        assert_eq!(schema.fields.len(), 66);
    }

    #[test]
    fn normalizes_a_portal_record() {
        let schema = fire_incidents_schema().unwrap();
        let record = RawRecord::from_value(json!({
            "incident_number": "24012345",
            "exposure_number": "0",
            "id": "240123450",
            "address": "100 Market St",
            "incident_date": "2024-03-01T00:00:00.000",
            "alarm_dttm": "2024-03-01T08:12:31.000",
            "city": "San Francisco",
            "suppression_units": "3",
            "no_flame_spead": "1 Limited to object of origin",
            "estimated_property_loss": "NaN",
            "point": {"type": "Point", "coordinates": [-122.39, 37.79]},
            "data_as_of": "2024-03-01T08:30:00.000",
            "data_loaded_at": "2024-03-02T03:00:00.000",
            ":@computed_region_ajp5_b2md": "32"
        }))
        .unwrap();

        let row = normalize_record(&schema, &record).unwrap();
        assert_eq!(row.id, "240123450");
        assert_eq!(
            row.value(&schema, "suppression_units"),
            Some(&FieldValue::Integer(3))
        );
        assert_eq!(
            row.value(&schema, "estimated_property_loss"),
            Some(&FieldValue::Null)
        );
        assert_eq!(row.value(&schema, "close_dttm"), Some(&FieldValue::Null));
        assert_eq!(
            row.value(&schema, "no_flame_spead"),
            Some(&FieldValue::Text("1 Limited to object of origin".into()))
        );
        assert!(matches!(
            row.value(&schema, "point"),
            Some(FieldValue::Json(_))
        ));
    }
}
