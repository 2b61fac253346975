//! 通用工具函数

/// 平均响应时间的平滑系数
pub const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

/// 指数移动平均，第一个样本直接作为初始值
pub fn exponential_moving_average(previous: f64, sample: f64, previous_samples: u64) -> f64 {
    if previous_samples == 0 {
        sample
    } else {
        RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * previous
    }
}

/// 以MB表示的容量换算为字节
pub fn megabytes(mb: u64) -> u64 {
    mb * 1024 * 1024
}
