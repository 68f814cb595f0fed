//! MQTT 主题命名

/// 控制命令主题：`ROBOT/{robot_id}/Control`
pub fn control_topic(robot_id: &str) -> String {
    format!("ROBOT/{}/Control", robot_id)
}

/// 状态反馈主题：`ROBOT/{robot_id}/Status`
pub fn status_topic(robot_id: &str) -> String {
    format!("ROBOT/{}/Status", robot_id)
}
