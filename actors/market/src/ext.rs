// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::StoragePower;
use fvm_shared::smooth::FilterEstimate;

pub mod miner {
    use super::*;

    pub const CONTROL_ADDRESSES_METHOD: u64 = 2;

    #[derive(Serialize_tuple, Deserialize_tuple)]
    pub struct GetControlAddressesReturnParams {
        pub owner: Address,
        pub worker: Address,
        pub control_addresses: Vec<Address>,
    }

    impl Cbor for GetControlAddressesReturnParams {}
}

pub mod verifreg {
    use super::*;

    pub const USE_BYTES_METHOD: u64 = 5;
    pub const RESTORE_BYTES_METHOD: u64 = 6;

    #[derive(Serialize_tuple, Deserialize_tuple)]
    pub struct UseBytesParams {
        /// Address of verified client.
        pub address: Address,
        /// Number of bytes to use.
        #[serde(with = "bigint_ser")]
        pub deal_size: BigInt,
    }

    impl Cbor for UseBytesParams {}

    #[derive(Serialize_tuple, Deserialize_tuple)]
    pub struct RestoreBytesParams {
        pub address: Address,
        #[serde(with = "bigint_ser")]
        pub deal_size: BigInt,
    }

    impl Cbor for RestoreBytesParams {}
}

pub mod power {
    use super::*;

    pub const CURRENT_TOTAL_POWER_METHOD: u64 = 9;

    #[derive(Serialize_tuple, Deserialize_tuple)]
    pub struct CurrentTotalPowerReturn {
        #[serde(with = "bigint_ser")]
        pub raw_byte_power: StoragePower,
        #[serde(with = "bigint_ser")]
        pub quality_adj_power: StoragePower,
        pub pledge_collateral: TokenAmount,
        pub quality_adj_power_smoothed: FilterEstimate,
    }

    impl Cbor for CurrentTotalPowerReturn {}
}

pub mod reward {
    pub const THIS_EPOCH_REWARD_METHOD: u64 = 3;
}
