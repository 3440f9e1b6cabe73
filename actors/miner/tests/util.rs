// Copyright 2019-2022 Storage Chain contributors
// SPDX-License-Identifier: Apache-2.0, MIT
#![allow(dead_code)]

use cid::multihash::MultihashDigest;
use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::reward::ThisEpochRewardReturn;
use fvm_shared::sector::{
    PoStProof, RegisteredPoStProof, RegisteredSealProof, SectorNumber, SectorSize, StoragePower,
};
use fvm_shared::smooth::FilterEstimate;
use fvm_shared::{commcid, METHOD_SEND};
use num_traits::Zero;

use storage_actor_miner::{
    ext, initial_pledge_for_power, max_prove_commit_duration, power_for_sectors,
    qa_power_for_weight, Actor, ConfirmSectorProofsParams, CronEventPayload, Deadline,
    DeadlineInfo, DeclareFaultsParams, DeclareFaultsRecoveredParams, DeferredCronEventParams,
    FaultDeclaration, Method, MinerConstructorParams, MinerInfo,
    Partition, PoStPartition, PowerPair, PreCommitSectorParams, RecoveryDeclaration,
    SectorOnChainInfo, SectorPreCommitOnChainInfo, State, SubmitWindowedPoStParams,
    TerminateSectorsParams, TerminateSectorsReturn, TerminationDeclaration,
    CRON_EVENT_PROVING_DEADLINE,
};
use storage_actors_runtime::cbor::serialize;
use storage_actors_runtime::runtime::{DomainSeparationTag, RuntimePolicy};
use storage_actors_runtime::test_utils::{
    expect_empty, MockRuntime, ACCOUNT_ACTOR_CODE_ID, INIT_ACTOR_CODE_ID, POWER_ACTOR_CODE_ID,
};
use storage_actors_runtime::{
    ActorError, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};

pub const BIG_BALANCE: u128 = 10_000_000_000_000_000_000_000_000; // 10M whole tokens

pub fn make_sealed_cid(input: &[u8]) -> Cid {
    let hash = cid::multihash::Code::Sha2_256.digest(input);
    // Wrap the raw digest in the poseidon code expected for sealed commitments.
    let mh = cid::multihash::Multihash::wrap(
        commcid::POSEIDON_BLS12_381_A1_FC1,
        hash.digest(),
    )
    .unwrap();
    Cid::new_v1(commcid::FIL_COMMITMENT_SEALED, mh)
}

pub fn make_unsealed_cid(input: &[u8]) -> Cid {
    let hash = cid::multihash::Code::Sha2_256.digest(input);
    let mh =
        cid::multihash::Multihash::wrap(commcid::SHA2_256_TRUNC254_PADDED, hash.digest()).unwrap();
    Cid::new_v1(commcid::FIL_COMMITMENT_UNSEALED, mh)
}

pub struct ActorHarness {
    pub receiver: Address,
    pub owner: Address,
    pub worker: Address,
    pub worker_key: Address,
    pub control_addrs: Vec<Address>,

    pub seal_proof_type: RegisteredSealProof,
    pub window_post_proof_type: RegisteredPoStProof,
    pub sector_size: SectorSize,
    pub partition_size: u64,
    pub period_offset: ChainEpoch,
    pub next_sector_no: SectorNumber,

    pub network_raw_power: StoragePower,
    pub network_qa_power: StoragePower,
    pub baseline_power: StoragePower,
    pub epoch_reward_smooth: FilterEstimate,
    pub epoch_qa_power_smooth: FilterEstimate,
}

impl ActorHarness {
    pub fn new(period_offset: ChainEpoch) -> ActorHarness {
        let receiver = Address::new_id(1000);
        let owner = Address::new_id(100);
        let worker = Address::new_id(101);
        let control_addrs = vec![Address::new_id(999), Address::new_id(998)];
        let worker_key = Address::new_bls(&[0u8; fvm_shared::address::BLS_PUB_LEN]).unwrap();
        let rwd = TokenAmount::from_whole(10);
        let pwr = StoragePower::from(1i64 << 50);
        let proof_type = RegisteredSealProof::StackedDRG32GiBV1P1;

        ActorHarness {
            receiver,
            owner,
            worker,
            worker_key,
            control_addrs,

            seal_proof_type: proof_type,
            window_post_proof_type: proof_type.registered_window_post_proof().unwrap(),
            sector_size: proof_type.sector_size().unwrap(),
            partition_size: proof_type.window_post_partitions_sector().unwrap(),
            period_offset,
            next_sector_no: 0,

            network_raw_power: pwr.clone(),
            network_qa_power: pwr.clone(),
            baseline_power: pwr.clone(),
            epoch_reward_smooth: FilterEstimate::new(rwd.atto().clone(), BigInt::from(0)),
            epoch_qa_power_smooth: FilterEstimate::new(pwr, BigInt::from(0)),
        }
    }

    pub fn new_runtime(&self) -> MockRuntime {
        let mut rt = MockRuntime::default();

        rt.policy.valid_post_proof_type = vec![self.window_post_proof_type];
        rt.policy.valid_pre_commit_proof_type = vec![self.seal_proof_type];

        rt.receiver = self.receiver;
        rt.actor_code_cids.insert(self.owner, *ACCOUNT_ACTOR_CODE_ID);
        rt.actor_code_cids.insert(self.worker, *ACCOUNT_ACTOR_CODE_ID);
        for addr in &self.control_addrs {
            rt.actor_code_cids.insert(*addr, *ACCOUNT_ACTOR_CODE_ID);
        }

        // A fixed hash yields a fixed proving period offset for the test.
        let offset = self.period_offset;
        rt.hash_func = Box::new(move |_| {
            let mut result = [0u8; 32];
            result[..8].copy_from_slice(&offset.to_be_bytes());
            result
        });

        rt
    }

    pub fn caller_addrs(&self) -> Vec<Address> {
        let mut addrs = self.control_addrs.clone();
        addrs.extend_from_slice(&[self.worker, self.owner]);
        addrs
    }

    pub fn construct_and_verify(&self, rt: &mut MockRuntime) {
        let params = MinerConstructorParams {
            owner: self.owner,
            worker: self.worker,
            control_addresses: self.control_addrs.clone(),
            window_post_proof_type: self.window_post_proof_type,
            peer_id: vec![0],
            multi_addresses: vec![],
        };

        rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);
        // Worker address is not a BLS key, so the actor will fetch the account key.
        rt.expect_send(
            self.worker,
            ext::account::PUBKEY_ADDRESS_METHOD,
            RawBytes::default(),
            TokenAmount::zero(),
            RawBytes::serialize(self.worker_key).unwrap(),
            ExitCode::OK,
        );

        let result = rt
            .call::<Actor>(Method::Constructor as u64, &RawBytes::serialize(params).unwrap())
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn get_state(&self, rt: &MockRuntime) -> State {
        rt.get_state::<State>()
    }

    pub fn get_info(&self, rt: &MockRuntime) -> MinerInfo {
        let state = self.get_state(rt);
        state.get_info(&rt.store).unwrap()
    }

    pub fn deadline(&self, rt: &MockRuntime) -> DeadlineInfo {
        let state = self.get_state(rt);
        state.recorded_deadline_info(&rt.policy, rt.epoch)
    }

    pub fn current_deadline(&self, rt: &MockRuntime) -> DeadlineInfo {
        let state = self.get_state(rt);
        state.deadline_info(&rt.policy, rt.epoch)
    }

    pub fn get_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> SectorOnChainInfo {
        let state = self.get_state(rt);
        state.get_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn get_precommit(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> SectorPreCommitOnChainInfo {
        let state = self.get_state(rt);
        state.get_precommitted_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn get_deadline_and_partition(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> (u64, u64) {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        deadlines.find_sector(&rt.policy, &rt.store, sector_number).unwrap()
    }

    pub fn get_deadline(&self, rt: &MockRuntime, dl_idx: u64) -> Deadline {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        deadlines.load_deadline(&rt.policy, &rt.store, dl_idx).unwrap()
    }

    pub fn get_partition(&self, rt: &MockRuntime, dl_idx: u64, p_idx: u64) -> Partition {
        self.get_deadline(rt, dl_idx).load_partition(&rt.store, p_idx).unwrap()
    }

    pub fn expect_query_network_info_reward_only(&self, rt: &mut MockRuntime) {
        let current_reward = ThisEpochRewardReturn {
            this_epoch_baseline_power: self.baseline_power.clone(),
            this_epoch_reward_smoothed: self.epoch_reward_smooth.clone(),
        };
        rt.expect_send(
            REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            RawBytes::default(),
            TokenAmount::zero(),
            RawBytes::serialize(current_reward).unwrap(),
            ExitCode::OK,
        );
    }

    pub fn expect_query_network_info(&self, rt: &mut MockRuntime) {
        let current_power = ext::power::CurrentTotalPowerReturn {
            raw_byte_power: self.network_raw_power.clone(),
            quality_adj_power: self.network_qa_power.clone(),
            pledge_collateral: TokenAmount::zero(),
            quality_adj_power_smoothed: self.epoch_qa_power_smooth.clone(),
        };
        let current_reward = ThisEpochRewardReturn {
            this_epoch_baseline_power: self.baseline_power.clone(),
            this_epoch_reward_smoothed: self.epoch_reward_smooth.clone(),
        };
        rt.expect_send(
            REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            RawBytes::default(),
            TokenAmount::zero(),
            RawBytes::serialize(current_reward).unwrap(),
            ExitCode::OK,
        );
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::CURRENT_TOTAL_POWER_METHOD,
            RawBytes::default(),
            TokenAmount::zero(),
            RawBytes::serialize(current_power).unwrap(),
            ExitCode::OK,
        );
    }

    pub fn make_pre_commit_params(
        &self,
        sector_no: u64,
        challenge: ChainEpoch,
        expiration: ChainEpoch,
        sector_deal_ids: Vec<DealID>,
    ) -> PreCommitSectorParams {
        PreCommitSectorParams {
            seal_proof: self.seal_proof_type,
            sector_number: sector_no,
            sealed_cid: make_sealed_cid(b"commr"),
            seal_rand_epoch: challenge,
            deal_ids: sector_deal_ids,
            expiration,
            // unused
            replace_capacity: false,
            replace_sector_deadline: 0,
            replace_sector_partition: 0,
            replace_sector_number: 0,
        }
    }

    /// Pre-commits a single sector, expecting success.
    pub fn pre_commit_sector(
        &self,
        rt: &mut MockRuntime,
        params: PreCommitSectorParams,
        first_for_miner: bool,
    ) -> SectorPreCommitOnChainInfo {
        let result = self.try_pre_commit_sector(rt, params.clone(), first_for_miner);
        expect_empty(result.unwrap());
        rt.verify();
        self.get_precommit(rt, params.sector_number)
    }

    pub fn try_pre_commit_sector(
        &self,
        rt: &mut MockRuntime,
        params: PreCommitSectorParams,
        first_for_miner: bool,
    ) -> Result<RawBytes, ActorError> {
        rt.expect_validate_caller_addr(self.caller_addrs());
        self.expect_query_network_info(rt);

        if !params.deal_ids.is_empty() {
            let vdparams = ext::market::VerifyDealsForActivationParamsRef {
                sectors: &[ext::market::SectorDeals {
                    sector_expiry: params.expiration,
                    deal_ids: params.deal_ids.clone(),
                }],
            };
            let vdreturn = ext::market::VerifyDealsForActivationReturn {
                sectors: vec![ext::market::SectorWeights {
                    deal_space: 32 << 30,
                    deal_weight: BigInt::from(0),
                    verified_deal_weight: BigInt::from(0),
                }],
            };
            rt.expect_send(
                storage_actors_runtime::STORAGE_MARKET_ACTOR_ADDR,
                ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
                RawBytes::serialize(vdparams).unwrap(),
                TokenAmount::zero(),
                RawBytes::serialize(vdreturn).unwrap(),
                ExitCode::OK,
            );
        }

        if first_for_miner {
            let state = self.get_state(rt);
            let dl_info = state.deadline_info(&rt.policy, rt.epoch);
            let cron_params = make_deadline_cron_event_params(dl_info.last());
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::ENROLL_CRON_EVENT_METHOD,
                cron_params,
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.call::<Actor>(
            Method::PreCommitSector as u64,
            &RawBytes::serialize(params).unwrap(),
        )
    }

    /// Performs prove-commit for the sector via the bulk-verify path: submits
    /// the proof to the power actor, then impersonates the power actor's
    /// confirmation.
    pub fn prove_commit_and_confirm(
        &self,
        rt: &mut MockRuntime,
        precommit: &SectorPreCommitOnChainInfo,
    ) -> SectorOnChainInfo {
        let sector_number = precommit.info.sector_number;

        // ProveCommitSector
        {
            rt.expect_validate_caller_any();
            // CommD fetched from the market.
            let commd = make_unsealed_cid(b"commd");
            let cdc_params = ext::market::ComputeDataCommitmentParamsRef {
                inputs: &[ext::market::SectorDataSpec {
                    deal_ids: precommit.info.deal_ids.clone(),
                    sector_type: precommit.info.seal_proof,
                }],
            };
            let cdc_ret = ext::market::ComputeDataCommitmentReturn { commds: vec![commd] };
            rt.expect_send(
                storage_actors_runtime::STORAGE_MARKET_ACTOR_ADDR,
                ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
                RawBytes::serialize(cdc_params).unwrap(),
                TokenAmount::zero(),
                RawBytes::serialize(cdc_ret).unwrap(),
                ExitCode::OK,
            );

            let entropy = serialize(&self.receiver, "address").unwrap();
            rt.expect_get_randomness_from_tickets(
                DomainSeparationTag::SealRandomness,
                precommit.info.seal_rand_epoch,
                entropy.to_vec(),
                [0u8; 32],
            );
            rt.expect_get_randomness_from_beacon(
                DomainSeparationTag::InteractiveSealChallengeSeed,
                precommit.pre_commit_epoch + rt.policy().pre_commit_challenge_delay,
                entropy.to_vec(),
                [0u8; 32],
            );

            // The proof itself is forwarded for bulk verification. The exact
            // SealVerifyInfo contents are checked by the power actor, so just accept
            // whatever the actor sends.
            rt.expectations.borrow_mut().expect_sends.push_back(
                storage_actors_runtime::test_utils::ExpectedMessage {
                    to: STORAGE_POWER_ACTOR_ADDR,
                    method: ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
                    params: RawBytes::serialize(&self.make_seal_verify_info(precommit, commd))
                        .unwrap(),
                    value: TokenAmount::zero(),
                    send_return: RawBytes::default(),
                    exit_code: ExitCode::OK,
                },
            );

            rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
            let params = storage_actor_miner::ProveCommitSectorParams {
                sector_number,
                proof: vec![0u8; 192].into(),
            };
            let result = rt
                .call::<Actor>(
                    Method::ProveCommitSector as u64,
                    &RawBytes::serialize(params).unwrap(),
                )
                .unwrap();
            expect_empty(result);
            rt.verify();
        }

        // ConfirmSectorProofsValid, as the power actor.
        {
            rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
            rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);

            // No deals, so no market activation. Expect the pledge update.
            let duration = precommit.info.expiration - rt.epoch;
            let qa_power = qa_power_for_weight(
                self.sector_size,
                duration,
                &precommit.deal_weight,
                &precommit.verified_deal_weight,
            );
            let pledge = initial_pledge_for_power(
                &qa_power,
                &self.baseline_power,
                &self.epoch_reward_smooth,
                &self.epoch_qa_power_smooth,
                &rt.circulating_supply,
            );
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
                RawBytes::serialize(&pledge).unwrap(),
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );

            let params = ConfirmSectorProofsParams {
                sectors: vec![sector_number],
                reward_smoothed: self.epoch_reward_smooth.clone(),
                reward_baseline_power: self.baseline_power.clone(),
                quality_adj_power_smoothed: self.epoch_qa_power_smooth.clone(),
            };
            let result = rt
                .call::<Actor>(
                    Method::ConfirmSectorProofsValid as u64,
                    &RawBytes::serialize(params).unwrap(),
                )
                .unwrap();
            expect_empty(result);
            rt.verify();
        }

        self.get_sector(rt, sector_number)
    }

    fn make_seal_verify_info(
        &self,
        precommit: &SectorPreCommitOnChainInfo,
        commd: Cid,
    ) -> fvm_shared::sector::SealVerifyInfo {
        fvm_shared::sector::SealVerifyInfo {
            registered_proof: precommit.info.seal_proof,
            sector_id: fvm_shared::sector::SectorID {
                miner: self.receiver.id().unwrap(),
                number: precommit.info.sector_number,
            },
            deal_ids: precommit.info.deal_ids.clone(),
            interactive_randomness: Randomness(vec![0u8; 32]),
            proof: vec![0u8; 192],
            randomness: Randomness(vec![0u8; 32]),
            sealed_cid: precommit.info.sealed_cid,
            unsealed_cid: commd,
        }
    }

    /// Commits a sector end-to-end: pre-commit then prove-commit and confirm.
    /// The epoch is advanced past the interactive challenge delay.
    pub fn commit_sector(
        &mut self,
        rt: &mut MockRuntime,
        lifetime_periods: i64,
        first_for_miner: bool,
    ) -> SectorOnChainInfo {
        let precommit_epoch = rt.epoch;
        let sector_no = self.next_sector_no;
        self.next_sector_no += 1;

        let expiration = self.deadline(rt).period_end()
            + lifetime_periods * rt.policy.wpost_proving_period;

        let params =
            self.make_pre_commit_params(sector_no, precommit_epoch - 1, expiration, vec![]);
        let precommit = self.pre_commit_sector(rt, params, first_for_miner);

        self.advance_to_epoch_with_cron(
            rt,
            precommit_epoch + rt.policy.pre_commit_challenge_delay + 1,
        );
        self.prove_commit_and_confirm(rt, &precommit)
    }

    pub fn make_post_proofs(&self) -> Vec<PoStProof> {
        vec![PoStProof {
            post_proof: self.window_post_proof_type,
            proof_bytes: vec![0u8; 192],
        }]
    }

    /// Submits a Window PoSt for one partition, expecting success.
    /// `expected_power_delta` is the power activated or recovered by the submission.
    /// If `recoveries_expected` the proof is verified on-chain rather than
    /// optimistically accepted.
    pub fn submit_window_post(
        &self,
        rt: &mut MockRuntime,
        deadline: &DeadlineInfo,
        partition_index: u64,
        skipped: BitField,
        infos: Vec<SectorOnChainInfo>,
        expected_power_delta: PowerPair,
        recoveries_expected: bool,
    ) {
        rt.expect_validate_caller_addr(self.caller_addrs());

        let chain_commit_epoch = deadline.challenge;
        let chain_commit_rand = [0x1u8; 32];
        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::PoStChainCommit,
            chain_commit_epoch,
            vec![],
            chain_commit_rand,
        );

        if recoveries_expected {
            let entropy = serialize(&self.receiver, "address").unwrap();
            let challenge_rand = [0x2u8; 32];
            rt.expect_get_randomness_from_beacon(
                DomainSeparationTag::WindowedPoStChallengeSeed,
                deadline.challenge,
                entropy.to_vec(),
                challenge_rand,
            );

            let vi = fvm_shared::sector::WindowPoStVerifyInfo {
                randomness: Randomness(challenge_rand.into()),
                proofs: self.make_post_proofs(),
                challenged_sectors: infos
                    .iter()
                    .map(|s| fvm_shared::sector::SectorInfo {
                        proof: s.seal_proof,
                        sector_number: s.sector_number,
                        sealed_cid: s.sealed_cid,
                    })
                    .collect(),
                prover: self.receiver.id().unwrap(),
            };
            rt.expect_verify_post(vi, ExitCode::OK);
        }

        if !expected_power_delta.is_zero() {
            let claim = ext::power::UpdateClaimedPowerParams {
                raw_byte_delta: expected_power_delta.raw,
                quality_adjusted_delta: expected_power_delta.qa,
            };
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_CLAIMED_POWER_METHOD,
                RawBytes::serialize(claim).unwrap(),
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }

        let params = SubmitWindowedPoStParams {
            deadline: deadline.index,
            partitions: vec![PoStPartition { index: partition_index, skipped }],
            proofs: self.make_post_proofs(),
            chain_commit_epoch,
            chain_commit_rand: Randomness(chain_commit_rand.into()),
        };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        let result = rt
            .call::<Actor>(
                Method::SubmitWindowedPoSt as u64,
                &RawBytes::serialize(params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn declare_faults(
        &self,
        rt: &mut MockRuntime,
        deadline: u64,
        partition: u64,
        sectors: BitField,
        fault_power: PowerPair,
    ) {
        rt.expect_validate_caller_addr(self.caller_addrs());

        if !fault_power.is_zero() {
            let claim = ext::power::UpdateClaimedPowerParams {
                raw_byte_delta: -fault_power.raw,
                quality_adjusted_delta: -fault_power.qa,
            };
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_CLAIMED_POWER_METHOD,
                RawBytes::serialize(claim).unwrap(),
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }

        let params = DeclareFaultsParams {
            faults: vec![FaultDeclaration { deadline, partition, sectors }],
        };
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        let result = rt
            .call::<Actor>(Method::DeclareFaults as u64, &RawBytes::serialize(params).unwrap())
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn declare_recoveries(
        &self,
        rt: &mut MockRuntime,
        deadline: u64,
        partition: u64,
        sectors: BitField,
    ) {
        rt.expect_validate_caller_addr(self.caller_addrs());

        let params = DeclareFaultsRecoveredParams {
            recoveries: vec![RecoveryDeclaration { deadline, partition, sectors }],
        };
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        let result = rt
            .call::<Actor>(
                Method::DeclareFaultsRecovered as u64,
                &RawBytes::serialize(params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    /// Runs the proving-deadline cron handler as the power actor.
    /// Additional expected sends (penalties, power changes) must be queued by the
    /// caller before invoking this, in the order: power update, burn, pledge update.
    pub fn on_deadline_cron(&self, rt: &mut MockRuntime, expect_enrollment: Option<ChainEpoch>) {
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);

        if let Some(next_deadline_last) = expect_enrollment {
            let cron_params = make_deadline_cron_event_params(next_deadline_last);
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::ENROLL_CRON_EVENT_METHOD,
                cron_params,
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }

        let params = make_deferred_cron_event_params(
            self.epoch_reward_smooth.clone(),
            self.epoch_qa_power_smooth.clone(),
        );
        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        let result = rt
            .call::<Actor>(
                Method::OnDeferredCronEvent as u64,
                &RawBytes::serialize(params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    /// Advances the chain to the close of the currently recorded deadline, runs the
    /// cron handler, and steps over into the next deadline.
    /// Only usable when the closing deadline requires no power/penalty side effects.
    pub fn advance_deadline(&self, rt: &mut MockRuntime) -> DeadlineInfo {
        let dl_info = self.deadline(rt);
        rt.set_epoch(dl_info.last());

        let state = self.get_state(rt);
        let next_enrollment = state.deadline_info(&rt.policy, rt.epoch + 1).last();
        self.on_deadline_cron(rt, Some(next_enrollment));
        rt.set_epoch(dl_info.close);
        self.deadline(rt)
    }

    /// Cron-advances deadlines until the recorded deadline has the given index,
    /// without processing it.
    pub fn advance_deadline_to(&self, rt: &mut MockRuntime, dl_idx: u64) -> DeadlineInfo {
        let mut dl_info = self.deadline(rt);
        while dl_info.index != dl_idx {
            dl_info = self.advance_deadline(rt);
        }
        dl_info
    }

    /// Advances through deadlines (running cron at each) until the target deadline
    /// index is the open one.
    pub fn advance_to_deadline(&self, rt: &mut MockRuntime, dl_idx: u64) -> DeadlineInfo {
        let dl_info = self.advance_deadline_to(rt, dl_idx);
        assert!(dl_info.is_open());
        dl_info
    }

    /// Advances the epoch to the target, running the deadline cron at the close of
    /// every deadline passed over on the way.
    pub fn advance_to_epoch_with_cron(&self, rt: &mut MockRuntime, epoch: ChainEpoch) {
        let mut dl_info = self.deadline(rt);
        while dl_info.last() < epoch {
            self.advance_deadline(rt);
            dl_info = self.deadline(rt);
        }
        rt.set_epoch(epoch);
    }

    pub fn terminate_sectors(
        &self,
        rt: &mut MockRuntime,
        deadline: u64,
        partition: u64,
        sectors: BitField,
        expected_fee: TokenAmount,
        expected_pledge_delta: TokenAmount,
        expected_power_delta: PowerPair,
    ) -> TerminateSectorsReturn {
        rt.expect_validate_caller_addr(self.caller_addrs());
        self.expect_query_network_info(rt);

        if expected_fee.is_positive() {
            rt.expect_send(
                storage_actors_runtime::BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                RawBytes::default(),
                expected_fee.clone(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }
        if !expected_pledge_delta.is_zero() {
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
                RawBytes::serialize(&expected_pledge_delta).unwrap(),
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }
        if !expected_power_delta.is_zero() {
            let claim = ext::power::UpdateClaimedPowerParams {
                raw_byte_delta: expected_power_delta.raw.clone(),
                quality_adjusted_delta: expected_power_delta.qa.clone(),
            };
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_CLAIMED_POWER_METHOD,
                RawBytes::serialize(claim).unwrap(),
                TokenAmount::zero(),
                RawBytes::default(),
                ExitCode::OK,
            );
        }

        let params = TerminateSectorsParams {
            terminations: vec![TerminationDeclaration { deadline, partition, sectors }],
        };
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        let result = rt
            .call::<Actor>(
                Method::TerminateSectors as u64,
                &RawBytes::serialize(params).unwrap(),
            )
            .unwrap();
        let ret: TerminateSectorsReturn = result.deserialize().unwrap();
        rt.verify();
        ret
    }

    pub fn sector_power(&self, sectors: &[SectorOnChainInfo]) -> PowerPair {
        power_for_sectors(self.sector_size, sectors)
    }

    pub fn max_prove_commit_duration(&self, rt: &MockRuntime) -> ChainEpoch {
        max_prove_commit_duration(&rt.policy, self.seal_proof_type).unwrap()
    }

    pub fn check_state_invariants(&self, rt: &MockRuntime) {
        let state = self.get_state(rt);
        state.check_balance_invariants(&rt.get_balance()).unwrap();

        // Partition-level invariants hold for every partition of every deadline.
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        deadlines
            .for_each(&rt.policy, &rt.store, |_, deadline| {
                let partitions = deadline.partitions_amt(&rt.store)?;
                partitions.for_each(|_, partition| partition.check_invariants())?;
                Ok(())
            })
            .unwrap();
    }
}

pub fn make_deadline_cron_event_params(epoch: ChainEpoch) -> RawBytes {
    let payload = CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE };
    let params = ext::power::EnrollCronEventParams {
        event_epoch: epoch,
        payload: RawBytes::serialize(payload).unwrap(),
    };
    RawBytes::serialize(params).unwrap()
}

pub fn make_deferred_cron_event_params(
    epoch_reward_smooth: FilterEstimate,
    epoch_qa_power_smooth: FilterEstimate,
) -> DeferredCronEventParams {
    let payload = CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE };
    DeferredCronEventParams {
        event_payload: Vec::from(RawBytes::serialize(payload).unwrap().bytes()),
        reward_smoothed: epoch_reward_smooth,
        quality_adj_power_smoothed: epoch_qa_power_smooth,
    }
}

pub fn big_balance() -> TokenAmount {
    TokenAmount::from_atto(BIG_BALANCE)
}
