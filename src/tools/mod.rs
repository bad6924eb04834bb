//! 工具层：多后端目录、调用表达式、MCP 传输与统一路由

pub mod backend;
pub mod expr;
pub mod mcp;
pub mod registry;
pub mod router;
pub mod schema;
pub mod transport;

pub use backend::{BackendConnector, ToolBackend};
pub use mcp::{McpClient, McpConnector};
pub use registry::{ToolCatalog, ToolCatalogEntry, ToolDescriptor};
pub use router::{unwrap_response, ToolRouter};
pub use schema::ParamShape;
pub use transport::{HttpTransport, StdioTransport, Transport};
