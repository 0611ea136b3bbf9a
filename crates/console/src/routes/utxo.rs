use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mempool_common::{MempoolError, MempoolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::rpc::BitcoinRpc;
use crate::state::SharedState;

const SATOSHIS_PER_BITCOIN: f64 = 100_000_000.0;

/// An unspent output of an address, in the shape wallets expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub status: UtxoStatus,
    /// Amount in satoshis.
    pub value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtxoStatus {
    pub confirmed: bool,
    pub block_height: u64,
    pub block_hash: String,
    pub block_time: i64,
}

#[derive(Debug, Deserialize)]
struct ScanResult {
    #[serde(default)]
    unspents: Vec<ScannedUnspent>,
}

#[derive(Debug, Deserialize)]
struct ScannedUnspent {
    txid: String,
    vout: u32,
    amount: f64,
}

#[derive(Debug, Default, Deserialize)]
struct TxInfo {
    #[serde(default)]
    blockhash: String,
    #[serde(default)]
    blocktime: i64,
    #[serde(default)]
    confirmations: i64,
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    height: u64,
}

/// GET /api/v1/address/{address}/utxo
pub async fn get_utxos(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<Utxo>>, ApiError> {
    if address.trim().is_empty() {
        return Err(
            ApiError::new(StatusCode::BAD_REQUEST, "address is required")
                .with_reason("the address path segment is blank"),
        );
    }

    let utxos = utxos_for_address(state.rpc.as_ref(), &address).await?;
    Ok(Json(utxos))
}

/// Scan the UTXO set for `address` and enrich each output with its
/// confirmation status.
pub async fn utxos_for_address(rpc: &dyn BitcoinRpc, address: &str) -> MempoolResult<Vec<Utxo>> {
    let descriptor = format!("addr({})", address);
    let scan = rpc
        .call("scantxoutset", vec![json!("start"), json!([descriptor])])
        .await?;
    let scan: ScanResult = decode("scantxoutset", scan)?;

    let mut utxos = Vec::with_capacity(scan.unspents.len());
    for unspent in scan.unspents {
        let tx = rpc
            .call("getrawtransaction", vec![json!(&unspent.txid), json!(true)])
            .await?;
        let tx: TxInfo = decode("getrawtransaction", tx)?;

        let confirmed = tx.confirmations > 0;
        let block_height = if confirmed {
            let block = rpc.call("getblock", vec![json!(&tx.blockhash)]).await?;
            decode::<BlockInfo>("getblock", block)?.height
        } else {
            0
        };

        utxos.push(Utxo {
            txid: unspent.txid,
            vout: unspent.vout,
            status: UtxoStatus {
                confirmed,
                block_height,
                block_hash: tx.blockhash,
                block_time: tx.blocktime,
            },
            value: (unspent.amount * SATOSHIS_PER_BITCOIN).round() as i64,
        });
    }

    Ok(utxos)
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> MempoolResult<T> {
    serde_json::from_value(value)
        .map_err(|e| MempoolError::Rpc(format!("error unmarshalling {} response: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers from canned responses and records the calls it received.
    struct ScriptedRpc {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BitcoinRpc for ScriptedRpc {
        async fn call(&self, method: &str, params: Vec<Value>) -> MempoolResult<Value> {
            self.calls.lock().unwrap().push(method.to_string());
            match method {
                "scantxoutset" => {
                    assert_eq!(params[1][0], "addr(bc1qexample)");
                    Ok(json!({
                        "success": true,
                        "unspents": [
                            {"txid": "aa", "vout": 0, "amount": 0.00012345},
                            {"txid": "bb", "vout": 3, "amount": 1.5}
                        ]
                    }))
                }
                "getrawtransaction" if params[0] == "aa" => Ok(json!({
                    "blockhash": "0000hash",
                    "blocktime": 1725873246,
                    "confirmations": 12
                })),
                "getrawtransaction" => Ok(json!({"confirmations": 0})),
                "getblock" => Ok(json!({"height": 860585})),
                other => Err(MempoolError::Rpc(format!("unexpected method {}", other))),
            }
        }
    }

    #[tokio::test]
    async fn enriches_scanned_outputs() {
        let rpc = ScriptedRpc { calls: Mutex::new(Vec::new()) };
        let utxos = utxos_for_address(&rpc, "bc1qexample").await.unwrap();

        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].value, 12_345);
        assert_eq!(
            utxos[0].status,
            UtxoStatus {
                confirmed: true,
                block_height: 860585,
                block_hash: "0000hash".into(),
                block_time: 1725873246,
            }
        );
        assert_eq!(utxos[1].value, 150_000_000);
        assert!(!utxos[1].status.confirmed);

        // Unconfirmed outputs skip the block lookup.
        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|m| *m == "getblock").count(), 1);
    }

    #[tokio::test]
    async fn malformed_scan_result_is_rpc_error() {
        struct Garbage;

        #[async_trait]
        impl BitcoinRpc for Garbage {
            async fn call(&self, _method: &str, _params: Vec<Value>) -> MempoolResult<Value> {
                Ok(json!({"unspents": "nope"}))
            }
        }

        let err = utxos_for_address(&Garbage, "bc1q").await.unwrap_err();
        assert!(matches!(err, MempoolError::Rpc(_)));
    }
}
