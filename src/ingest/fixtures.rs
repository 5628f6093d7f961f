//! Recorded Flood Hub payloads for unit tests.

pub const GAUGE_TARBELA: &str = r#"{
  "gaugeId": "hybas_4120570410",
  "location": {"latitude": 34.09, "longitude": 72.69},
  "source": "WAPDA",
  "siteName": "Tarbela",
  "river": "Indus",
  "qualityVerified": true,
  "hasModel": true
}"#;

pub const MODEL_TARBELA: &str = r#"{
  "gaugeId": "hybas_4120570410",
  "gaugeModelId": "hybas_4120570410_model",
  "thresholds": {
    "warningLevel": 4500.0,
    "dangerLevel": 5500.0,
    "extremeDangerLevel": 6500.0
  },
  "gaugeValueUnit": "CUBIC_METERS_PER_SECOND"
}"#;

pub const GAUGE_UNNAMED_HYBAS: &str = r#"{
  "gaugeId": "hybas_4121489010",
  "location": {"latitude": 27.41, "longitude": 68.12},
  "source": "HYBAS",
  "siteName": "",
  "river": " ",
  "qualityVerified": false,
  "hasModel": true
}"#;
