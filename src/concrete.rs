//! Concrete execution of the analysed bytecode inside revm.

use crate::error::{PathfinderError, Result};
use revm::db::{CacheDB, EmptyDB};
use revm::primitives::{
    AccountInfo, Address, Bytecode, Bytes, ExecutionResult, TransactTo, KECCAK_EMPTY, U256,
};
use revm::Evm;
use serde::Serialize;

/// Account the bytecode is installed at.
pub const CONTRACT_ADDRESS: Address = Address::with_last_byte(0xc0);
/// Sender of the transaction.
pub const CALLER_ADDRESS: Address = Address::with_last_byte(0xca);

const GAS_LIMIT: u64 = 30_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcreteResult {
    pub success: bool,
    pub reverted: bool,
    #[serde(with = "hex::serde")]
    pub output: Vec<u8>,
    pub gas_used: u64,
}

/// Call `code` as deployed runtime code with the given input and value.
pub fn run(code: &[u8], calldata: &[u8], value: U256) -> Result<ConcreteResult> {
    let mut db = CacheDB::new(EmptyDB::default());
    let code_obj = Bytecode::new_raw(Bytes::copy_from_slice(code));
    db.insert_account_info(
        CONTRACT_ADDRESS,
        AccountInfo::new(U256::ZERO, 1, code_obj.hash_slow(), code_obj),
    );
    db.insert_account_info(
        CALLER_ADDRESS,
        AccountInfo::new(value, 0, KECCAK_EMPTY, Bytecode::new()),
    );

    let mut evm = Evm::builder()
        .with_db(db)
        .modify_tx_env(|tx| {
            tx.caller = CALLER_ADDRESS;
            tx.transact_to = TransactTo::Call(CONTRACT_ADDRESS);
            tx.data = Bytes::copy_from_slice(calldata);
            tx.value = value;
            tx.gas_limit = GAS_LIMIT;
            tx.gas_price = U256::ZERO;
        })
        .build();
    let outcome = evm
        .transact()
        .map_err(|e| PathfinderError::Concrete(format!("{e:?}")))?;

    let result = match outcome.result {
        ExecutionResult::Success {
            gas_used, output, ..
        } => ConcreteResult {
            success: true,
            reverted: false,
            output: output.data().to_vec(),
            gas_used,
        },
        ExecutionResult::Revert { gas_used, output } => ConcreteResult {
            success: false,
            reverted: true,
            output: output.to_vec(),
            gas_used,
        },
        ExecutionResult::Halt { reason, gas_used } => {
            tracing::debug!("[CONCRETE] execution halted: {:?}", reason);
            ConcreteResult {
                success: false,
                reverted: false,
                output: Vec::new(),
                gas_used,
            }
        }
    };
    Ok(result)
}
