//! Definitions of Solidity functions called during deployment

use alloy_sol_types::sol;

sol! {
    function upgradeAndCall(address proxy, address implementation, bytes memory data) external payable;
}
