//! JSON RPC handlers for creating and deleting devices.

use serde::Deserialize;
use serde_json::Value;

use crate::backing::BackingStore;
use crate::config::UbiBdevOpts;
use crate::device::{create_ubi_bdev, delete_ubi_bdev};
use crate::error::UbiError;
use crate::registry::UbiRegistry;

#[derive(Deserialize)]
struct DeleteParams {
    name: String,
}

/// Dispatch one RPC request. `bdev_ubi_create` answers with the created bdev
/// name, `bdev_ubi_delete` with `true`; errors surface as `UbiError`.
pub fn dispatch(
    method: &str,
    params: Value,
    store: &dyn BackingStore,
    registry: &UbiRegistry,
) -> Result<Value, UbiError> {
    match method {
        "bdev_ubi_create" => {
            let opts: UbiBdevOpts = serde_json::from_value(params)
                .map_err(|e| UbiError::InvalidConfig(format!("bad create params: {e}")))?;
            let bdev = create_ubi_bdev(&opts, store, registry)?;
            Ok(Value::String(bdev.name().to_string()))
        }
        "bdev_ubi_delete" => {
            let params: DeleteParams = serde_json::from_value(params)
                .map_err(|e| UbiError::InvalidConfig(format!("bad delete params: {e}")))?;
            delete_ubi_bdev(&params.name, registry)?;
            Ok(Value::Bool(true))
        }
        _ => Err(UbiError::NotFound(format!("method {method}"))),
    }
}
