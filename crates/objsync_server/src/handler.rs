//! Request dispatch.
//!
//! [`RequestHandler`] maps protocol envelopes onto [`ProtocolService`]
//! calls. Every error comes back as a [`Response::Fault`]; nothing is
//! dropped on the way.

use crate::error::{ServiceError, ServiceResult};
use crate::service::ProtocolService;
use objsync_protocol::{Fault, FaultKind, Request, Response};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Dispatches requests to a shared service.
#[derive(Clone)]
pub struct RequestHandler {
    service: Arc<ProtocolService>,
}

impl RequestHandler {
    /// Creates a handler for `service`.
    pub fn new(service: Arc<ProtocolService>) -> Self {
        Self { service }
    }

    /// Returns the service.
    pub fn service(&self) -> &Arc<ProtocolService> {
        &self.service
    }

    /// Handles one request.
    pub fn handle(&self, request: Request) -> Response {
        let operation = request.operation();
        match self.dispatch(request) {
            Ok(response) => {
                debug!(operation, "request completed");
                response
            }
            Err(e) => {
                match e.kind() {
                    FaultKind::Internal => error!(operation, error = %e, "request failed"),
                    _ => warn!(operation, error = %e, aborted = e.is_abort(), "request rejected"),
                }
                Response::Fault(e.to_fault())
            }
        }
    }

    /// Handles one CBOR-encoded request and returns the CBOR-encoded response.
    ///
    /// Undecodable input is answered with a protocol fault.
    pub fn handle_encoded(&self, bytes: &[u8]) -> ServiceResult<Vec<u8>> {
        let response = match Request::decode(bytes) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(error = %e, "undecodable request");
                Response::Fault(Fault {
                    kind: FaultKind::Protocol,
                    message: e.to_string(),
                    aborted: false,
                })
            }
        };
        response.encode().map_err(ServiceError::from)
    }

    fn dispatch(&self, request: Request) -> ServiceResult<Response> {
        let service = &self.service;
        Ok(match request {
            Request::Init => {
                service.init()?;
                Response::Initialized
            }
            Request::Shutdown => {
                service.shutdown()?;
                Response::ShutDown
            }
            Request::OpenSession { user, credential } => {
                Response::Session(service.open_session(&user, &credential)?)
            }
            Request::CloseSession { session } => {
                service.close_session(&session)?;
                Response::SessionClosed
            }
            Request::AuthorizeVisibility {
                session,
                member_id,
                target,
            } => Response::Authorization(service.authorize_visibility(&session, &member_id, &target)?),
            Request::AuthorizeUsability {
                session,
                member_id,
                target,
            } => Response::Authorization(service.authorize_usability(&session, &member_id, &target)?),
            Request::GetObject {
                session,
                oid,
                type_name,
            } => Response::Object(service.get_object(&session, &oid, &type_name)?),
            Request::ResolveField {
                session,
                target,
                field_id,
            } => Response::Object(service.resolve_field(&session, &target, &field_id)?),
            Request::ResolveImmediately { session, target } => {
                Response::Object(service.resolve_immediately(&session, &target)?)
            }
            Request::FindInstances { session, query } => {
                Response::Instances(service.find_instances(&session, &query)?)
            }
            Request::HasInstances { session, type_name } => {
                Response::HasInstances(service.has_instances(&session, &type_name)?)
            }
            Request::SetAssociation {
                session,
                member_id,
                target,
                associate,
            } => Response::Updates(service.set_association(&session, &member_id, &target, &associate)?),
            Request::SetValue {
                session,
                member_id,
                target,
                value,
            } => Response::Updates(service.set_value(&session, &member_id, &target, &value)?),
            Request::ClearAssociation {
                session,
                member_id,
                target,
                associate,
            } => Response::Updates(service.clear_association(&session, &member_id, &target, &associate)?),
            Request::ClearValue {
                session,
                member_id,
                target,
            } => Response::Updates(service.clear_value(&session, &member_id, &target)?),
            Request::AddToCollection {
                session,
                member_id,
                target,
                element,
            } => Response::Updates(service.add_to_collection(&session, &member_id, &target, &element)?),
            Request::RemoveFromCollection {
                session,
                member_id,
                target,
                element,
            } => Response::Updates(service.remove_from_collection(&session, &member_id, &target, &element)?),
            Request::ExecuteClientAction { session, operations } => {
                Response::ClientAction(service.execute_client_action(&session, &operations)?)
            }
            Request::ExecuteServerAction {
                session,
                action_kind,
                action_id,
                target,
                parameter_types,
                parameters,
            } => Response::ServerAction(service.execute_server_action(
                &session,
                action_kind,
                &action_id,
                &target,
                &parameter_types,
                &parameters,
            )?),
            Request::OidForService { session, service_id } => {
                Response::Object(service.oid_for_service(&session, &service_id)?)
            }
            Request::GetProperties { session } => Response::Properties(service.get_properties(&session)?),
        })
    }
}
