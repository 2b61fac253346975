//! DICOM JSON 归一化
//!
//! 把QIDO-RS返回的 `{"0020000D": {"vr": "UI", "Value": [...]}}` 形式
//! 映射为固定的属性名表。

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use pacs_core::{fields, DicomQueryResult, PacsError, QueryLevel, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// 标签 → 归一化属性名
pub const TAG_TABLE: &[(Tag, &str)] = &[
    (tags::PATIENT_NAME, fields::PATIENT_NAME),
    (tags::PATIENT_ID, fields::PATIENT_ID),
    (tags::PATIENT_BIRTH_DATE, fields::PATIENT_BIRTH_DATE),
    (tags::PATIENT_SEX, fields::PATIENT_SEX),
    (tags::STUDY_INSTANCE_UID, fields::STUDY_INSTANCE_UID),
    (tags::STUDY_ID, fields::STUDY_ID),
    (tags::STUDY_DATE, fields::STUDY_DATE),
    (tags::STUDY_TIME, fields::STUDY_TIME),
    (tags::STUDY_DESCRIPTION, fields::STUDY_DESCRIPTION),
    (tags::ACCESSION_NUMBER, fields::ACCESSION_NUMBER),
    (tags::SERIES_INSTANCE_UID, fields::SERIES_INSTANCE_UID),
    (tags::SERIES_NUMBER, fields::SERIES_NUMBER),
    (tags::SERIES_DESCRIPTION, fields::SERIES_DESCRIPTION),
    (tags::MODALITY, fields::MODALITY),
    (tags::SOP_CLASS_UID, fields::SOP_CLASS_UID),
    (tags::SOP_INSTANCE_UID, fields::SOP_INSTANCE_UID),
    (tags::INSTANCE_NUMBER, fields::INSTANCE_NUMBER),
];

/// DICOM JSON 中使用的8位十六进制标签键
pub fn tag_key(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.0, tag.1)
}

/// 根据标签键或属性名查找归一化属性名
pub fn field_for_key(key: &str) -> Option<&'static str> {
    TAG_TABLE
        .iter()
        .find(|(tag, name)| key.eq_ignore_ascii_case(&tag_key(*tag)) || key == *name)
        .map(|(_, name)| *name)
}

/// 归一化属性名对应的标签
pub fn tag_for_field(field: &str) -> Option<Tag> {
    TAG_TABLE.iter().find(|(_, name)| *name == field).map(|(tag, _)| *tag)
}

/// 归一化单个数据集对象
///
/// 未知标签被忽略；同时接受已经使用属性名作为键的简化JSON。
pub fn normalize_dataset(dataset: &Value) -> Result<BTreeMap<String, String>> {
    let object = dataset
        .as_object()
        .ok_or_else(|| PacsError::Protocol(format!("数据集不是JSON对象: {}", dataset)))?;

    let mut data = BTreeMap::new();
    for (key, element) in object {
        let Some(field) = field_for_key(key) else {
            continue;
        };
        data.insert(field.to_string(), element_value(element)?);
    }
    Ok(data)
}

/// 解析QIDO-RS响应数组
pub fn parse_query_response(level: QueryLevel, body: &Value) -> Result<Vec<DicomQueryResult>> {
    let items = body
        .as_array()
        .ok_or_else(|| PacsError::Protocol("查询响应不是JSON数组".to_string()))?;

    items
        .iter()
        .map(|item| DicomQueryResult::from_attributes(level, normalize_dataset(item)?))
        .collect()
}

fn element_value(element: &Value) -> Result<String> {
    match element {
        Value::Object(map) if map.contains_key("vr") || map.contains_key("Value") => {
            let values = match map.get("Value") {
                Some(Value::Array(values)) => values,
                Some(other) => {
                    return Err(PacsError::Protocol(format!("Value 字段不是数组: {}", other)));
                }
                None => return Ok(String::new()),
            };
            let parts: Vec<String> = values.iter().map(scalar_value).collect();
            Ok(parts.join("\\"))
        }
        other => Ok(scalar_value(other)),
    }
}

fn scalar_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        // PN: {"Alphabetic": "Doe^John"}
        Value::Object(map) => map
            .get("Alphabetic")
            .or_else(|| map.get("Ideographic"))
            .or_else(|| map.get("Phonetic"))
            .map(scalar_value)
            .unwrap_or_default(),
        Value::Array(items) => items.iter().map(scalar_value).collect::<Vec<_>>().join("\\"),
    }
}
