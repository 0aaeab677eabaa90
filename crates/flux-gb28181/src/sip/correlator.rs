// SIP 对话关联
// 从 INVITE 请求与其响应中提取后续 BYE 所需的对话标识

use super::message::{SipHeaders, SipRequest, SipResponse};
use crate::error::CorrelationError;
use serde::{Deserialize, Serialize};

/// 标识一个已建立对话的字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogIds {
    pub call_id: String,

    /// 本端 tag（请求 From）
    pub from_tag: String,

    /// 远端 tag（响应 To）
    pub to_tag: String,

    /// 请求顶层 Via 的 branch
    pub branch: String,
}

/// 提取对话标识
///
/// 按 Call-ID、From tag、To tag、Via branch 的顺序读取，遇到第一个缺失字段即返回错误，
/// 调用方只能看到第一个缺失项。
pub fn extract(request: &SipRequest, response: &SipResponse) -> Result<DialogIds, CorrelationError> {
    let call_id = request.call_id().ok_or(CorrelationError::MissingCallId)?;
    let from_tag = request.from_tag().ok_or(CorrelationError::MissingFromTag)?;
    let to_tag = response.to_tag().ok_or(CorrelationError::MissingToTag)?;
    let branch = request.via_branch().ok_or(CorrelationError::MissingBranch)?;

    Ok(DialogIds {
        call_id: call_id.to_string(),
        from_tag,
        to_tag,
        branch,
    })
}
