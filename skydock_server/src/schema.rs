//! Diesel table definitions for the deployment orchestrator.

diesel::table! {
    integrations (id) {
        id -> Int8,
        user_id -> Varchar,
        owner -> Varchar,
        repo -> Varchar,
        installation_id -> Nullable<Varchar>,
        mirror_repo -> Nullable<Varchar>,
        build_project_id -> Nullable<Varchar>,
        deploy_project_id -> Nullable<Varchar>,
        pipeline_id -> Nullable<Varchar>,
        registry_url -> Nullable<Varchar>,
        image_repository -> Nullable<Varchar>,
        branch -> Varchar,
        auto_deploy_enabled -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    deployment_runs (id) {
        id -> Int8,
        user_id -> Varchar,
        owner -> Varchar,
        repo -> Varchar,
        commit_sha -> Varchar,
        commit_message -> Nullable<Text>,
        commit_author -> Nullable<Varchar>,
        commit_url -> Nullable<Varchar>,
        trigger_kind -> Varchar,
        pipeline_mode -> Bool,
        status -> Varchar,
        mirror_status -> Varchar,
        build_status -> Varchar,
        deploy_status -> Varchar,
        mirror_duration_seconds -> Nullable<Int4>,
        build_duration_seconds -> Nullable<Int4>,
        deploy_duration_seconds -> Nullable<Int4>,
        image_name -> Nullable<Varchar>,
        image_tag -> Nullable<Varchar>,
        image_url -> Nullable<Varchar>,
        cluster_id -> Nullable<Varchar>,
        namespace -> Varchar,
        is_rollback -> Bool,
        rolled_back_from_id -> Nullable<Int8>,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        total_duration_seconds -> Nullable<Int4>,
        error_stage -> Nullable<Varchar>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(integrations, deployment_runs);
