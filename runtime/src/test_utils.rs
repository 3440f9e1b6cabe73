// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use core::fmt;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::anyhow;
use cid::multihash::{Code, Multihash};
use cid::Cid;
use fvm_ipld_blockstore::MemoryBlockstore;
use fvm_ipld_encoding::de::DeserializeOwned;
use fvm_ipld_encoding::{Cbor, CborStore, RawBytes};
use fvm_shared::address::{Address, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::consensus::ConsensusFault;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::PieceInfo;
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use fvm_shared::sector::{
    AggregateSealVerifyProofAndInfos, RegisteredSealProof, ReplicaUpdateInfo, SealVerifyInfo,
    WindowPoStVerifyInfo,
};
use fvm_shared::MethodNum;
use lazy_static::lazy_static;
use multihash::derive::Multihash as MultihashDerive;
use multihash::MultihashDigest;

use crate::runtime::builtins::Type;
use crate::runtime::{
    ActorCode, DomainSeparationTag, MessageInfo, Policy, Primitives, Runtime, RuntimePolicy,
    Verifier,
};
use crate::{actor_error, ActorError};

const IPLD_RAW: u64 = 0x55;

/// An identity CID over raw bytes, usable as a fake code CID.
pub fn make_builtin(bz: &[u8]) -> Cid {
    Cid::new_v1(IPLD_RAW, Multihash::wrap(0, bz).expect("name too long"))
}

lazy_static! {
    pub static ref SYSTEM_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/system");
    pub static ref INIT_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/init");
    pub static ref CRON_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/cron");
    pub static ref ACCOUNT_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/account");
    pub static ref POWER_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/storagepower");
    pub static ref MINER_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/storageminer");
    pub static ref MARKET_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/storagemarket");
    pub static ref PAYCH_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/paymentchannel");
    pub static ref MULTISIG_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/multisig");
    pub static ref REWARD_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/reward");
    pub static ref VERIFREG_ACTOR_CODE_ID: Cid = make_builtin(b"storage/test/verifiedregistry");
    pub static ref ACTOR_TYPES: BTreeMap<Cid, Type> = BTreeMap::from([
        (*SYSTEM_ACTOR_CODE_ID, Type::System),
        (*INIT_ACTOR_CODE_ID, Type::Init),
        (*CRON_ACTOR_CODE_ID, Type::Cron),
        (*ACCOUNT_ACTOR_CODE_ID, Type::Account),
        (*POWER_ACTOR_CODE_ID, Type::Power),
        (*MINER_ACTOR_CODE_ID, Type::Miner),
        (*MARKET_ACTOR_CODE_ID, Type::Market),
        (*PAYCH_ACTOR_CODE_ID, Type::PaymentChannel),
        (*MULTISIG_ACTOR_CODE_ID, Type::Multisig),
        (*REWARD_ACTOR_CODE_ID, Type::Reward),
        (*VERIFREG_ACTOR_CODE_ID, Type::VerifiedRegistry),
    ]);
}

#[derive(Clone, Copy, Debug, Eq, MultihashDerive, PartialEq)]
#[mh(alloc_size = 64)]
enum MhCode {
    #[mh(code = 0xb220, hasher = multihash::Blake2b256)]
    Blake2b256,
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let hash = MhCode::Blake2b256.digest(data);
    let mut ret = [0u8; 32];
    ret.copy_from_slice(hash.digest());
    ret
}

/// A runtime for unit-testing a single actor in isolation. Everything an actor
/// observes through the `Runtime` traits is scripted in advance through
/// `expect_*` calls; a call the test did not script panics, and `verify()`
/// panics on anything scripted but never consumed.
pub struct MockRuntime {
    pub epoch: ChainEpoch,
    pub base_fee: TokenAmount,
    pub id_addresses: HashMap<Address, Address>,
    pub actor_code_cids: HashMap<Address, Cid>,
    pub receiver: Address,
    pub caller: Address,
    pub caller_type: Cid,
    pub value_received: TokenAmount,
    pub hash_func: Box<dyn Fn(&[u8]) -> [u8; 32]>,

    // Actor State
    pub state: Option<Cid>,
    pub balance: RefCell<TokenAmount>,

    // VM Impl
    pub in_call: bool,
    pub store: MemoryBlockstore,
    pub in_transaction: bool,

    // Expectations
    pub expectations: RefCell<Expectations>,

    // policy
    pub policy: Policy,

    pub circulating_supply: TokenAmount,
}

#[derive(Default)]
pub struct Expectations {
    pub expect_validate_caller_any: bool,
    pub expect_validate_caller_addr: Option<Vec<Address>>,
    pub expect_validate_caller_type: Option<Vec<Type>>,
    pub expect_sends: VecDeque<ExpectedMessage>,
    pub expect_verify_sigs: VecDeque<ExpectedVerifySig>,
    pub expect_verify_seal: Option<ExpectVerifySeal>,
    pub expect_verify_post: Option<ExpectVerifyPoSt>,
    pub expect_compute_unsealed_sector_cid: VecDeque<ExpectComputeUnsealedSectorCid>,
    pub expect_verify_consensus_fault: Option<ExpectVerifyConsensusFault>,
    pub expect_get_randomness_tickets: VecDeque<ExpectRandomness>,
    pub expect_get_randomness_beacon: VecDeque<ExpectRandomness>,
    pub expect_batch_verify_seals: Option<ExpectBatchVerifySeals>,
    pub expect_aggregate_verify_seals: Option<ExpectAggregateVerifySeals>,
    pub expect_replica_verify: Option<ExpectReplicaVerify>,
    pub expect_gas_charge: VecDeque<i64>,
}

impl Expectations {
    fn reset(&mut self) {
        *self = Default::default();
    }

    fn verify(&mut self) {
        macro_rules! all_consumed {
            ($field:ident, none) => {
                assert!(
                    self.$field.is_none(),
                    concat!(stringify!($field), " scripted but never used: {:?}"),
                    self.$field
                );
            };
            ($field:ident, empty) => {
                assert!(
                    self.$field.is_empty(),
                    concat!(stringify!($field), " scripted but never used: {:?}"),
                    self.$field
                );
            };
        }

        assert!(!self.expect_validate_caller_any, "caller-any validation scripted but never used");
        all_consumed!(expect_validate_caller_addr, none);
        all_consumed!(expect_validate_caller_type, none);
        all_consumed!(expect_sends, empty);
        all_consumed!(expect_verify_sigs, empty);
        all_consumed!(expect_verify_seal, none);
        all_consumed!(expect_verify_post, none);
        all_consumed!(expect_compute_unsealed_sector_cid, empty);
        all_consumed!(expect_verify_consensus_fault, none);
        all_consumed!(expect_get_randomness_tickets, empty);
        all_consumed!(expect_get_randomness_beacon, empty);
        all_consumed!(expect_batch_verify_seals, none);
        all_consumed!(expect_aggregate_verify_seals, none);
        all_consumed!(expect_replica_verify, none);
        all_consumed!(expect_gas_charge, empty);
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            epoch: Default::default(),
            base_fee: Default::default(),
            id_addresses: Default::default(),
            actor_code_cids: Default::default(),
            receiver: Address::new_id(0),
            caller: Address::new_id(0),
            caller_type: Default::default(),
            value_received: Default::default(),
            hash_func: Box::new(blake2b_256),
            state: Default::default(),
            balance: Default::default(),
            in_call: Default::default(),
            store: Default::default(),
            in_transaction: Default::default(),
            expectations: Default::default(),
            policy: Default::default(),
            circulating_supply: Default::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExpectedMessage {
    pub to: Address,
    pub method: MethodNum,
    pub params: RawBytes,
    pub value: TokenAmount,

    // what the scripted send produces
    pub send_return: RawBytes,
    pub exit_code: ExitCode,
}

#[derive(Debug)]
pub struct ExpectedVerifySig {
    pub sig: Signature,
    pub signer: Address,
    pub plaintext: Vec<u8>,
    pub result: Result<(), anyhow::Error>,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifySeal {
    seal: SealVerifyInfo,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifyPoSt {
    post: WindowPoStVerifyInfo,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifyConsensusFault {
    require_correct_input: bool,
    block_header_1: Vec<u8>,
    block_header_2: Vec<u8>,
    block_header_extra: Vec<u8>,
    fault: Option<ConsensusFault>,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectComputeUnsealedSectorCid {
    reg: RegisteredSealProof,
    pieces: Vec<PieceInfo>,
    cid: Cid,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectRandomness {
    tag: DomainSeparationTag,
    epoch: ChainEpoch,
    entropy: Vec<u8>,
    out: [u8; RANDOMNESS_LENGTH],
}

#[derive(Debug)]
pub struct ExpectBatchVerifySeals {
    input: Vec<SealVerifyInfo>,
    result: anyhow::Result<Vec<bool>>,
}

#[derive(Debug)]
pub struct ExpectAggregateVerifySeals {
    in_proof: Vec<u8>,
    result: anyhow::Result<()>,
}

#[derive(Debug)]
pub struct ExpectReplicaVerify {
    input: ReplicaUpdateInfo,
    result: anyhow::Result<()>,
}

/// A scripted oracle failure, carried out of the mock as the exit code the
/// actor should abort with.
fn scripted_failure(exit_code: ExitCode) -> anyhow::Error {
    anyhow!(ActorError::unchecked(exit_code, "scripted failure".to_string()))
}

pub fn expect_empty(res: RawBytes) {
    assert_eq!(res, RawBytes::default());
}

pub fn expect_abort_contains_message<T: fmt::Debug>(
    expect_exit_code: ExitCode,
    expect_msg: &str,
    res: Result<T, ActorError>,
) {
    let err = res.expect_err(&format!(
        "call succeeded but should have aborted with exit code {}",
        expect_exit_code
    ));
    assert_eq!(
        err.exit_code(),
        expect_exit_code,
        "aborted with exit code {} where {} was expected; error message: {}",
        err.exit_code(),
        expect_exit_code,
        err.msg(),
    );
    assert!(
        err.msg().contains(expect_msg),
        "error message '{}' does not contain '{}'",
        err.msg(),
        expect_msg,
    );
}

pub fn expect_abort<T: fmt::Debug>(exit_code: ExitCode, res: Result<T, ActorError>) {
    expect_abort_contains_message(exit_code, "", res);
}

impl MockRuntime {
    ///// Runtime access for tests /////

    pub fn new() -> Self {
        Default::default()
    }

    pub fn get_state<T: Cbor>(&self) -> T {
        self.store_get(self.state.as_ref().unwrap())
    }

    pub fn replace_state<C: Cbor>(&mut self, obj: &C) {
        self.state = Some(self.store_put(obj));
    }

    pub fn set_balance(&mut self, amount: TokenAmount) {
        *self.balance.get_mut() = amount;
    }

    pub fn get_balance(&self) -> TokenAmount {
        self.balance.borrow().to_owned()
    }

    pub fn add_balance(&mut self, amount: TokenAmount) {
        *self.balance.get_mut() += amount;
    }

    pub fn set_value(&mut self, value: TokenAmount) {
        self.value_received = value;
    }

    pub fn set_caller(&mut self, code_id: Cid, address: Address) {
        self.caller = address;
        self.caller_type = code_id;
        self.actor_code_cids.insert(address, code_id);
    }

    pub fn set_address_actor_type(&mut self, address: Address, actor_type: Cid) {
        self.actor_code_cids.insert(address, actor_type);
    }

    pub fn set_received(&mut self, amount: TokenAmount) {
        self.value_received = amount;
    }

    pub fn set_base_fee(&mut self, base_fee: TokenAmount) {
        self.base_fee = base_fee;
    }

    pub fn set_circulating_supply(&mut self, circ_supply: TokenAmount) {
        self.circulating_supply = circ_supply;
    }

    pub fn set_epoch(&mut self, epoch: ChainEpoch) {
        self.epoch = epoch;
    }

    /// Invokes an actor method as the VM would. State changes roll back when
    /// the method aborts.
    pub fn call<A: ActorCode>(
        &mut self,
        method_num: MethodNum,
        params: &RawBytes,
    ) -> Result<RawBytes, ActorError> {
        self.in_call = true;
        let prev_state = self.state;
        let res = A::invoke_method(self, method_num, params);

        if res.is_err() {
            self.state = prev_state;
        }
        self.in_call = false;
        res
    }

    /// Panics unless every scripted expectation was consumed.
    pub fn verify(&mut self) {
        self.expectations.borrow_mut().verify()
    }

    /// Discards whatever expectations remain.
    pub fn reset(&mut self) {
        self.expectations.borrow_mut().reset();
    }

    ///// Mock expectations /////

    pub fn expect_validate_caller_addr(&mut self, addr: Vec<Address>) {
        assert!(!addr.is_empty(), "addrs must be non-empty");
        self.expectations.get_mut().expect_validate_caller_addr = Some(addr);
    }

    pub fn expect_validate_caller_type(&mut self, types: Vec<Type>) {
        assert!(!types.is_empty(), "types must be non-empty");
        self.expectations.borrow_mut().expect_validate_caller_type = Some(types);
    }

    pub fn expect_validate_caller_any(&self) {
        self.expectations.borrow_mut().expect_validate_caller_any = true;
    }

    pub fn expect_verify_signature(&self, exp: ExpectedVerifySig) {
        self.expectations.borrow_mut().expect_verify_sigs.push_back(exp);
    }

    pub fn expect_verify_consensus_fault(
        &self,
        h1: Vec<u8>,
        h2: Vec<u8>,
        extra: Vec<u8>,
        fault: Option<ConsensusFault>,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_verify_consensus_fault =
            Some(ExpectVerifyConsensusFault {
                require_correct_input: true,
                block_header_1: h1,
                block_header_2: h2,
                block_header_extra: extra,
                fault,
                exit_code,
            });
    }

    pub fn expect_compute_unsealed_sector_cid(
        &self,
        reg: RegisteredSealProof,
        pieces: Vec<PieceInfo>,
        cid: Cid,
        exit_code: ExitCode,
    ) {
        self.expectations
            .borrow_mut()
            .expect_compute_unsealed_sector_cid
            .push_back(ExpectComputeUnsealedSectorCid { reg, pieces, cid, exit_code });
    }

    pub fn expect_send(
        &mut self,
        to: Address,
        method: MethodNum,
        params: RawBytes,
        value: TokenAmount,
        send_return: RawBytes,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_sends.push_back(ExpectedMessage {
            to,
            method,
            params,
            value,
            send_return,
            exit_code,
        })
    }

    pub fn expect_verify_seal(&mut self, seal: SealVerifyInfo, exit_code: ExitCode) {
        self.expectations.borrow_mut().expect_verify_seal =
            Some(ExpectVerifySeal { seal, exit_code });
    }

    pub fn expect_verify_post(&mut self, post: WindowPoStVerifyInfo, exit_code: ExitCode) {
        self.expectations.borrow_mut().expect_verify_post =
            Some(ExpectVerifyPoSt { post, exit_code });
    }

    pub fn expect_get_randomness_from_tickets(
        &mut self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: Vec<u8>,
        out: [u8; RANDOMNESS_LENGTH],
    ) {
        self.expectations
            .borrow_mut()
            .expect_get_randomness_tickets
            .push_back(ExpectRandomness { tag, epoch, entropy, out });
    }

    pub fn expect_get_randomness_from_beacon(
        &mut self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: Vec<u8>,
        out: [u8; RANDOMNESS_LENGTH],
    ) {
        self.expectations
            .borrow_mut()
            .expect_get_randomness_beacon
            .push_back(ExpectRandomness { tag, epoch, entropy, out });
    }

    pub fn expect_batch_verify_seals(
        &mut self,
        input: Vec<SealVerifyInfo>,
        result: anyhow::Result<Vec<bool>>,
    ) {
        self.expectations.borrow_mut().expect_batch_verify_seals =
            Some(ExpectBatchVerifySeals { input, result });
    }

    pub fn expect_aggregate_verify_seals(
        &mut self,
        in_proof: Vec<u8>,
        result: anyhow::Result<()>,
    ) {
        self.expectations.borrow_mut().expect_aggregate_verify_seals =
            Some(ExpectAggregateVerifySeals { in_proof, result });
    }

    pub fn expect_replica_verify(&mut self, input: ReplicaUpdateInfo, result: anyhow::Result<()>) {
        self.expectations.borrow_mut().expect_replica_verify =
            Some(ExpectReplicaVerify { input, result });
    }

    pub fn expect_gas_charge(&mut self, value: i64) {
        self.expectations.borrow_mut().expect_gas_charge.push_back(value);
    }

    ///// Private helpers /////

    fn require_in_call(&self) {
        assert!(self.in_call, "runtime accessed outside of a method call")
    }

    fn store_put<C: Cbor>(&self, o: &C) -> Cid {
        self.store.put_cbor(&o, Code::Blake2b256).unwrap()
    }

    fn store_get<T: DeserializeOwned>(&self, cid: &Cid) -> T {
        self.store.get_cbor(cid).unwrap().unwrap()
    }

    fn draw_randomness(
        &self,
        expected: ExpectRandomness,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> [u8; RANDOMNESS_LENGTH] {
        assert!(epoch <= self.epoch, "randomness drawn from future epoch {}", epoch);
        assert_eq!(
            expected.tag, tag,
            "domain separation tag mismatch: scripted {:?}, drawn {:?}",
            expected.tag, tag
        );
        assert_eq!(
            expected.epoch, epoch,
            "randomness epoch mismatch: scripted {:?}, drawn {:?}",
            expected.epoch, epoch
        );
        assert_eq!(
            expected.entropy, *entropy,
            "randomness entropy mismatch: scripted {:?}, drawn {:?}",
            expected.entropy, entropy
        );
        expected.out
    }
}

impl MessageInfo for MockRuntime {
    fn caller(&self) -> Address {
        self.caller
    }
    fn receiver(&self) -> Address {
        self.receiver
    }
    fn value_received(&self) -> TokenAmount {
        self.value_received.clone()
    }
}

impl Runtime<MemoryBlockstore> for MockRuntime {
    fn message(&self) -> &dyn MessageInfo {
        self.require_in_call();
        self
    }

    fn curr_epoch(&self) -> ChainEpoch {
        self.require_in_call();
        self.epoch
    }

    fn validate_immediate_caller_accept_any(&mut self) -> Result<(), ActorError> {
        self.require_in_call();
        assert!(
            self.expectations.borrow_mut().expect_validate_caller_any,
            "caller-any validation not scripted"
        );
        self.expectations.borrow_mut().expect_validate_caller_any = false;
        Ok(())
    }

    fn validate_immediate_caller_is<'a, I>(&mut self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        self.require_in_call();

        let addrs: Vec<Address> = addresses.into_iter().cloned().collect();

        let mut expectations = self.expectations.borrow_mut();
        let scripted = expectations
            .expect_validate_caller_addr
            .take()
            .expect("caller-address validation not scripted");
        assert_eq!(
            addrs, scripted,
            "validated against caller addrs {:?} where {:?} was scripted",
            addrs, scripted
        );

        if addrs.contains(&self.caller) {
            return Ok(());
        }
        Err(actor_error!(forbidden;
                "caller address {:?} forbidden, allowed: {:?}",
                self.caller, &addrs
        ))
    }

    fn validate_immediate_caller_type<'a, I>(&mut self, types: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Type>,
    {
        self.require_in_call();
        let types: Vec<Type> = types.into_iter().copied().collect();
        let scripted = self
            .expectations
            .borrow_mut()
            .expect_validate_caller_type
            .take()
            .expect("caller-type validation not scripted");
        assert_eq!(
            types, scripted,
            "validated against caller types {:?} where {:?} was scripted",
            types, scripted,
        );

        if let Some(call_type) = ACTOR_TYPES.get(&self.caller_type) {
            if types.contains(call_type) {
                return Ok(());
            }
        }

        Err(actor_error!(forbidden; "caller type {:?} forbidden, allowed: {:?}",
                self.caller_type, types))
    }

    fn current_balance(&self) -> TokenAmount {
        self.require_in_call();
        self.balance.borrow().clone()
    }

    fn resolve_address(&self, address: &Address) -> Option<Address> {
        self.require_in_call();
        if address.protocol() == Protocol::ID {
            return Some(*address);
        }
        self.id_addresses.get(address).cloned()
    }

    fn get_actor_code_cid(&self, addr: &Address) -> Option<Cid> {
        self.require_in_call();
        self.actor_code_cids.get(addr).cloned()
    }

    fn resolve_builtin_actor_type(&self, code_id: &Cid) -> Option<Type> {
        self.require_in_call();
        ACTOR_TYPES.get(code_id).copied()
    }

    fn get_code_cid_for_type(&self, typ: Type) -> Cid {
        self.require_in_call();
        ACTOR_TYPES
            .iter()
            .find_map(|(cid, t)| (*t == typ).then(|| *cid))
            .unwrap()
    }

    fn get_randomness_from_tickets(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_get_randomness_tickets
            .pop_front()
            .expect("chain randomness not scripted");
        Ok(self.draw_randomness(expected, tag, epoch, entropy))
    }

    fn get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_get_randomness_beacon
            .pop_front()
            .expect("beacon randomness not scripted");
        Ok(self.draw_randomness(expected, tag, epoch, entropy))
    }

    fn create<C: Cbor>(&mut self, obj: &C) -> Result<(), ActorError> {
        if self.state.is_some() {
            return Err(actor_error!(illegal_state; "state already constructed"));
        }
        self.state = Some(self.store_put(obj));
        Ok(())
    }

    fn state<C: Cbor>(&self) -> Result<C, ActorError> {
        Ok(self.store_get(self.state.as_ref().unwrap()))
    }

    fn transaction<C, RT, F>(&mut self, f: F) -> Result<RT, ActorError>
    where
        C: Cbor,
        F: FnOnce(&mut C, &mut Self) -> Result<RT, ActorError>,
    {
        if self.in_transaction {
            return Err(actor_error!(assertion_failed; "nested transaction"));
        }
        let mut working_state = self.state()?;
        self.in_transaction = true;
        let ret = f(&mut working_state, self);
        if ret.is_ok() {
            self.state = Some(self.store_put(&working_state));
        }
        self.in_transaction = false;
        ret
    }

    fn store(&self) -> &MemoryBlockstore {
        &self.store
    }

    fn send(
        &mut self,
        to: &Address,
        method: MethodNum,
        params: RawBytes,
        value: TokenAmount,
    ) -> Result<RawBytes, ActorError> {
        self.require_in_call();
        if self.in_transaction {
            return Err(actor_error!(assertion_failed; "side-effect within transaction"));
        }

        let scripted = self
            .expectations
            .borrow_mut()
            .expect_sends
            .pop_front()
            .unwrap_or_else(|| {
                panic!(
                    "send not scripted: to {:?} method {:?} value {:?} params {:?}",
                    to, method, value, params
                )
            });

        assert_eq!(scripted.to, *to);
        assert_eq!(scripted.method, method);
        assert_eq!(scripted.params, params);
        assert_eq!(scripted.value, value);

        {
            let mut balance = self.balance.borrow_mut();
            if value > *balance {
                return Err(ActorError::unchecked(
                    ExitCode::SYS_SENDER_STATE_INVALID,
                    format!("cannot send value: {:?} exceeds balance: {:?}", value, *balance),
                ));
            }
            *balance -= value;
        }

        match scripted.exit_code {
            ExitCode::OK => Ok(scripted.send_return),
            code => Err(ActorError::unchecked(code, "scripted send failure".to_string())),
        }
    }

    fn total_fil_circ_supply(&self) -> TokenAmount {
        self.circulating_supply.clone()
    }

    fn base_fee(&self) -> TokenAmount {
        self.base_fee.clone()
    }

    fn charge_gas(&mut self, _name: &'static str, value: i64) {
        let scripted = self
            .expectations
            .borrow_mut()
            .expect_gas_charge
            .pop_front()
            .unwrap_or_else(|| panic!("gas charge not scripted: {:?}", value));
        assert_eq!(scripted, value, "gas charge mismatch: scripted {:?}, charged {:?}", scripted, value);
    }
}

impl Primitives for MockRuntime {
    fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
    ) -> Result<(), anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_sigs
            .pop_front()
            .expect("signature verification not scripted");
        assert_eq!(exp.sig, *signature, "signature mismatch");
        assert_eq!(exp.signer, *signer, "signer mismatch");
        assert_eq!(exp.plaintext, plaintext, "plaintext mismatch");
        exp.result
    }

    fn hash_blake2b(&self, data: &[u8]) -> [u8; 32] {
        (*self.hash_func)(data)
    }

    fn compute_unsealed_sector_cid(
        &self,
        reg: RegisteredSealProof,
        pieces: &[PieceInfo],
    ) -> Result<Cid, anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_compute_unsealed_sector_cid
            .pop_front()
            .expect("unsealed sector CID computation not scripted");

        assert_eq!(exp.reg, reg, "unsealed CID seal proof type mismatch");
        assert!(exp.pieces[..].eq(pieces), "unsealed CID piece set mismatch");

        if exp.exit_code != ExitCode::OK {
            return Err(scripted_failure(exp.exit_code));
        }
        Ok(exp.cid)
    }
}

impl Verifier for MockRuntime {
    fn verify_seal(&self, seal: &SealVerifyInfo) -> Result<(), anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_seal
            .take()
            .expect("seal verification not scripted");

        assert_eq!(exp.seal, *seal, "seal verification input mismatch");
        if exp.exit_code != ExitCode::OK {
            return Err(scripted_failure(exp.exit_code));
        }
        Ok(())
    }

    fn verify_post(&self, post: &WindowPoStVerifyInfo) -> Result<(), anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_post
            .take()
            .expect("post verification not scripted");

        assert_eq!(exp.post, *post, "post verification input mismatch");
        if exp.exit_code != ExitCode::OK {
            return Err(scripted_failure(exp.exit_code));
        }
        Ok(())
    }

    fn verify_consensus_fault(
        &self,
        h1: &[u8],
        h2: &[u8],
        extra: &[u8],
    ) -> Result<Option<ConsensusFault>, anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_consensus_fault
            .take()
            .expect("consensus fault verification not scripted");

        if exp.require_correct_input {
            assert_eq!(exp.block_header_1, h1, "header 1 mismatch");
            assert_eq!(exp.block_header_2, h2, "header 2 mismatch");
            assert_eq!(exp.block_header_extra, extra, "header extra mismatch");
        }

        if exp.exit_code != ExitCode::OK {
            return Err(scripted_failure(exp.exit_code));
        }

        Ok(exp.fault)
    }

    fn batch_verify_seals(&self, batch: &[SealVerifyInfo]) -> anyhow::Result<Vec<bool>> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_batch_verify_seals
            .take()
            .expect("batch seal verification not scripted");
        assert_eq!(exp.input.len(), batch.len(), "batch length mismatch");

        for (scripted, seal) in exp.input.iter().zip(batch) {
            assert_eq!(scripted.sealed_cid, seal.sealed_cid, "sealed CID mismatch");
            assert_eq!(scripted.unsealed_cid, seal.unsealed_cid, "unsealed CID mismatch");
            assert_eq!(scripted.proof, seal.proof, "proof mismatch");
        }
        exp.result
    }

    fn verify_aggregate_seals(
        &self,
        aggregate: &AggregateSealVerifyProofAndInfos,
    ) -> Result<(), anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_aggregate_verify_seals
            .take()
            .expect("aggregate seal verification not scripted");
        assert_eq!(exp.in_proof, aggregate.proof, "aggregate proof mismatch");
        exp.result
    }

    fn verify_replica_update(&self, replica: &ReplicaUpdateInfo) -> Result<(), anyhow::Error> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_replica_verify
            .take()
            .expect("replica update verification not scripted");
        assert_eq!(exp.input.update_proof_type, replica.update_proof_type, "proof type mismatch");
        assert_eq!(exp.input.new_sealed_cid, replica.new_sealed_cid, "new sealed CID mismatch");
        assert_eq!(exp.input.old_sealed_cid, replica.old_sealed_cid, "old sealed CID mismatch");
        assert_eq!(
            exp.input.new_unsealed_cid, replica.new_unsealed_cid,
            "new unsealed CID mismatch"
        );
        exp.result
    }
}

impl RuntimePolicy for MockRuntime {
    fn policy(&self) -> &Policy {
        &self.policy
    }
}
