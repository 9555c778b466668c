use std::sync::Arc;

use serde_json::{Map, Value};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::{
    gateway::MessageSender,
    message::segments_from_proto,
    proto::{
        self,
        bot_service_server::{BotService as BotServiceContract, BotServiceServer},
    },
};

/// Upstream gRPC surface plugins call back into. Gateway failures are
/// folded into the `{success, error}` response payload; a plugin never
/// sees them as RPC-level errors.
pub struct BotService {
    sender: Arc<dyn MessageSender>,
}

impl BotService {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    pub fn into_server(self) -> BotServiceServer<Self> {
        BotServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl BotServiceContract for BotService {
    async fn send_message(
        &self,
        request: Request<proto::SendMessageRequest>,
    ) -> Result<Response<proto::SendMessageResponse>, Status> {
        let req = request.into_inner();
        debug!(
            target: "botplane.hostrpc",
            "SendMessage: type={}, user_id={}, group_id={}, segments={}",
            req.message_type,
            req.user_id,
            req.group_id,
            req.segments.len()
        );

        let segments = segments_from_proto(&req.segments);
        let result = if req.message_type == "private" {
            self.sender
                .send_private_message(req.user_id, &segments)
                .await
        } else {
            self.sender.send_group_message(req.group_id, &segments).await
        };

        let response = match result {
            Ok(()) => proto::SendMessageResponse {
                success: true,
                error: String::new(),
                message_id: 0,
            },
            Err(err) => proto::SendMessageResponse {
                success: false,
                error: err.to_string(),
                message_id: 0,
            },
        };
        Ok(Response::new(response))
    }

    async fn get_user_info(
        &self,
        request: Request<proto::GetUserInfoRequest>,
    ) -> Result<Response<proto::UserInfo>, Status> {
        let req = request.into_inner();
        // Best-effort: the gateway offers no cheap lookup, so this stays a
        // placeholder the way the admin tooling expects.
        Ok(Response::new(proto::UserInfo {
            user_id: req.user_id,
            nickname: "unknown".to_string(),
            card: String::new(),
            role: String::new(),
        }))
    }

    async fn get_group_info(
        &self,
        request: Request<proto::GetGroupInfoRequest>,
    ) -> Result<Response<proto::GroupInfo>, Status> {
        let req = request.into_inner();
        Ok(Response::new(proto::GroupInfo {
            group_id: req.group_id,
            group_name: "unknown".to_string(),
            member_count: 0,
        }))
    }

    async fn log(
        &self,
        request: Request<proto::LogRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        match req.level.as_str() {
            "debug" => debug!(target: "botplane.plugin", "{}", req.message),
            "warn" => warn!(target: "botplane.plugin", "{}", req.message),
            "error" => error!(target: "botplane.plugin", "{}", req.message),
            _ => info!(target: "botplane.plugin", "{}", req.message),
        }
        Ok(Response::new(proto::Empty {}))
    }

    async fn upload_group_file(
        &self,
        request: Request<proto::UploadGroupFileRequest>,
    ) -> Result<Response<proto::UploadFileResponse>, Status> {
        let req = request.into_inner();
        let folder = if req.folder.is_empty() {
            "/"
        } else {
            req.folder.as_str()
        };

        let result = self
            .sender
            .upload_group_file(req.group_id, &req.file_path, &req.file_name, folder)
            .await;
        Ok(Response::new(upload_response(result)))
    }

    async fn upload_private_file(
        &self,
        request: Request<proto::UploadPrivateFileRequest>,
    ) -> Result<Response<proto::UploadFileResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .sender
            .upload_private_file(req.user_id, &req.file_path, &req.file_name)
            .await;
        Ok(Response::new(upload_response(result)))
    }

    async fn call_api(
        &self,
        request: Request<proto::CallApiRequest>,
    ) -> Result<Response<proto::CallApiResponse>, Status> {
        let req = request.into_inner();
        debug!(target: "botplane.hostrpc", "CallApi: action={}", req.action);

        let mut params = Map::new();
        for (key, value) in req.params {
            params.insert(key, Value::String(value));
        }

        let response = match self.sender.call_api(&req.action, Value::Object(params)).await {
            Ok(data) => proto::CallApiResponse {
                success: true,
                error: String::new(),
                data,
            },
            Err(err) => proto::CallApiResponse {
                success: false,
                error: err.to_string(),
                data: Vec::new(),
            },
        };
        Ok(Response::new(response))
    }
}

fn upload_response(result: crate::error::Result<()>) -> proto::UploadFileResponse {
    match result {
        Ok(()) => proto::UploadFileResponse {
            success: true,
            error: String::new(),
        },
        Err(err) => proto::UploadFileResponse {
            success: false,
            error: err.to_string(),
        },
    }
}
